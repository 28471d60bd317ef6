use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

pub const DB_FILE_NAME: &str = "cbcrank.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    // ensure_* helpers upgrade workspaces created before a column existed.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            id TEXT PRIMARY KEY,
            label TEXT NOT NULL,
            max_marks INTEGER NOT NULL,
            sort_order INTEGER NOT NULL,
            updated_at TEXT,
            UNIQUE(label)
        )",
        [],
    )?;
    ensure_subjects_updated_at(&conn)?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            registration_no TEXT NOT NULL,
            last_name TEXT NOT NULL,
            first_name TEXT NOT NULL,
            grade TEXT NOT NULL,
            active INTEGER NOT NULL,
            sort_order INTEGER NOT NULL,
            updated_at TEXT,
            UNIQUE(registration_no)
        )",
        [],
    )?;
    ensure_students_updated_at(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_grade ON students(grade, sort_order)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS marks(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            grade TEXT NOT NULL,
            term INTEGER NOT NULL,
            academic_year INTEGER NOT NULL,
            raw_marks REAL NOT NULL,
            updated_at TEXT,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            UNIQUE(student_id, subject_id, term, academic_year)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_marks_student ON marks(student_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_marks_subject ON marks(subject_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_marks_class ON marks(grade, academic_year, term)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    Ok(conn)
}

pub fn settings_get_json(
    conn: &Connection,
    key: &str,
) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = ?",
            [key],
            |r| r.get(0),
        )
        .optional()?;
    match raw {
        Some(text) => Ok(Some(serde_json::from_str(&text)?)),
        None => Ok(None),
    }
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}

pub fn settings_delete(conn: &Connection, key: &str) -> anyhow::Result<()> {
    conn.execute("DELETE FROM settings WHERE key = ?", [key])?;
    Ok(())
}

fn ensure_subjects_updated_at(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "subjects", "updated_at")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE subjects ADD COLUMN updated_at TEXT", [])?;
    Ok(())
}

fn ensure_students_updated_at(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "students", "updated_at")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE students ADD COLUMN updated_at TEXT", [])?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

pub fn now_stamp() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_dir(prefix: &str) -> std::path::PathBuf {
        let p = std::env::temp_dir().join(format!(
            "{}-{}",
            prefix,
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .expect("clock")
                .as_nanos()
        ));
        std::fs::create_dir_all(&p).expect("create temp dir");
        p
    }

    #[test]
    fn open_is_idempotent_and_adds_missing_columns() {
        let ws = temp_dir("cbcrank-db-open");
        {
            let conn = Connection::open(ws.join(DB_FILE_NAME)).expect("open raw");
            conn.execute(
                "CREATE TABLE subjects(
                    id TEXT PRIMARY KEY,
                    label TEXT NOT NULL,
                    max_marks INTEGER NOT NULL,
                    sort_order INTEGER NOT NULL,
                    UNIQUE(label)
                )",
                [],
            )
            .expect("old subjects table");
        }
        let conn = open_db(&ws).expect("open migrated");
        assert!(table_has_column(&conn, "subjects", "updated_at").expect("pragma"));
        drop(conn);
        let conn = open_db(&ws).expect("reopen");
        assert!(table_has_column(&conn, "students", "updated_at").expect("pragma"));
        let _ = std::fs::remove_dir_all(ws);
    }

    #[test]
    fn fresh_workspace_has_current_columns() {
        let ws = temp_dir("cbcrank-db-fresh");
        let conn = open_db(&ws).expect("open");
        for table in ["subjects", "students", "marks"] {
            assert!(
                table_has_column(&conn, table, "updated_at").expect("pragma"),
                "{} missing updated_at",
                table
            );
        }
        let _ = std::fs::remove_dir_all(ws);
    }

    #[test]
    fn settings_roundtrip_and_delete() {
        let ws = temp_dir("cbcrank-db-settings");
        let conn = open_db(&ws).expect("open");
        assert_eq!(settings_get_json(&conn, "k").expect("get"), None);
        settings_set_json(&conn, "k", &serde_json::json!({ "a": 1 })).expect("set");
        settings_set_json(&conn, "k", &serde_json::json!({ "a": 2 })).expect("overwrite");
        assert_eq!(
            settings_get_json(&conn, "k").expect("get"),
            Some(serde_json::json!({ "a": 2 }))
        );
        settings_delete(&conn, "k").expect("delete");
        assert_eq!(settings_get_json(&conn, "k").expect("get"), None);
        let _ = std::fs::remove_dir_all(ws);
    }
}
