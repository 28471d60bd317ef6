use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, db_err, is_constraint_violation, optional_str, required_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct StudentRow {
    pub id: String,
    pub registration_no: String,
    pub last_name: String,
    pub first_name: String,
    pub grade: String,
    pub active: bool,
    pub sort_order: i64,
}

impl StudentRow {
    pub fn display_name(&self) -> String {
        format!("{}, {}", self.last_name, self.first_name)
    }

    fn to_json(&self) -> serde_json::Value {
        json!({
            "id": self.id,
            "registrationNo": self.registration_no,
            "lastName": self.last_name,
            "firstName": self.first_name,
            "displayName": self.display_name(),
            "grade": self.grade,
            "active": self.active,
            "sortOrder": self.sort_order
        })
    }
}

fn student_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<StudentRow> {
    Ok(StudentRow {
        id: r.get(0)?,
        registration_no: r.get(1)?,
        last_name: r.get(2)?,
        first_name: r.get(3)?,
        grade: r.get(4)?,
        active: r.get::<_, i64>(5)? != 0,
        sort_order: r.get(6)?,
    })
}

const STUDENT_COLUMNS: &str =
    "id, registration_no, last_name, first_name, grade, active, sort_order";

pub fn load_student(conn: &Connection, student_id: &str) -> rusqlite::Result<Option<StudentRow>> {
    let sql = format!("SELECT {} FROM students WHERE id = ?", STUDENT_COLUMNS);
    conn.query_row(&sql, [student_id], student_from_row).optional()
}

/// Students enrolled in `grade`, in class order. `None` lists every grade.
pub fn load_students(
    conn: &Connection,
    grade: Option<&str>,
    include_inactive: bool,
) -> rusqlite::Result<Vec<StudentRow>> {
    let sql = format!(
        "SELECT {}
         FROM students
         WHERE (?1 IS NULL OR grade = ?1) AND (?2 = 1 OR active = 1)
         ORDER BY grade, sort_order, last_name, first_name",
        STUDENT_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map((grade, include_inactive as i64), student_from_row)?
        .collect::<Result<Vec<_>, _>>();
    rows
}

fn handle_students_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "students": [] }));
    };
    let grade = match optional_str(req, "grade") {
        Ok(v) => v.filter(|g| !g.is_empty()),
        Err(e) => return e,
    };
    let include_inactive = req
        .params
        .get("includeInactive")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    match load_students(conn, grade.as_deref(), include_inactive) {
        Ok(rows) => ok(
            &req.id,
            json!({ "students": rows.iter().map(StudentRow::to_json).collect::<Vec<_>>() }),
        ),
        Err(e) => db_err(req, "db_query_failed", e),
    }
}

fn handle_students_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let registration_no = match required_str(req, "registrationNo") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let last_name = match required_str(req, "lastName") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let first_name = match required_str(req, "firstName") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let grade = match required_str(req, "grade") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let active = match req.params.get("active") {
        None => true,
        Some(v) => match v.as_bool() {
            Some(b) => b,
            None => return err(&req.id, "bad_params", "active must be boolean", None),
        },
    };

    let sort_order: i64 = match conn.query_row(
        "SELECT COALESCE(MAX(sort_order) + 1, 0) FROM students WHERE grade = ?",
        [&grade],
        |r| r.get(0),
    ) {
        Ok(n) => n,
        Err(e) => return db_err(req, "db_query_failed", e),
    };

    let student_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO students(id, registration_no, last_name, first_name, grade, active, sort_order, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &student_id,
            &registration_no,
            &last_name,
            &first_name,
            &grade,
            active as i64,
            sort_order,
            db::now_stamp(),
        ),
    ) {
        if is_constraint_violation(&e) {
            return err(
                &req.id,
                "conflict",
                format!("registration number {} is already enrolled", registration_no),
                None,
            );
        }
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "students" })),
        );
    }

    ok(&req.id, json!({ "studentId": student_id }))
}

fn handle_students_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(patch) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "patch must be an object", None);
    };

    let mut row = match load_student(conn, &student_id) {
        Ok(Some(r)) => r,
        Ok(None) => return err(&req.id, "not_found", "student not found", None),
        Err(e) => return db_err(req, "db_query_failed", e),
    };

    for (k, v) in patch {
        match k.as_str() {
            "registrationNo" | "lastName" | "firstName" | "grade" => {
                let Some(s) = v.as_str().map(str::trim).filter(|s| !s.is_empty()) else {
                    return err(
                        &req.id,
                        "bad_params",
                        format!("{} must be a non-empty string", k),
                        None,
                    );
                };
                let s = s.to_string();
                match k.as_str() {
                    "registrationNo" => row.registration_no = s,
                    "lastName" => row.last_name = s,
                    "firstName" => row.first_name = s,
                    _ => row.grade = s,
                }
            }
            "active" => {
                let Some(b) = v.as_bool() else {
                    return err(&req.id, "bad_params", "active must be boolean", None);
                };
                row.active = b;
            }
            "sortOrder" => {
                let Some(n) = v.as_i64() else {
                    return err(&req.id, "bad_params", "sortOrder must be integer", None);
                };
                row.sort_order = n;
            }
            _ => return err(&req.id, "bad_params", format!("unknown student field: {}", k), None),
        }
    }

    if let Err(e) = conn.execute(
        "UPDATE students
         SET registration_no = ?, last_name = ?, first_name = ?, grade = ?, active = ?, sort_order = ?, updated_at = ?
         WHERE id = ?",
        (
            &row.registration_no,
            &row.last_name,
            &row.first_name,
            &row.grade,
            row.active as i64,
            row.sort_order,
            db::now_stamp(),
            &row.id,
        ),
    ) {
        if is_constraint_violation(&e) {
            return err(
                &req.id,
                "conflict",
                format!("registration number {} is already enrolled", row.registration_no),
                None,
            );
        }
        return db_err(req, "db_update_failed", e);
    }

    ok(&req.id, json!({ "student": row.to_json() }))
}

fn handle_students_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    match load_student(conn, &student_id) {
        Ok(Some(_)) => {}
        Ok(None) => return err(&req.id, "not_found", "student not found", None),
        Err(e) => return db_err(req, "db_query_failed", e),
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return db_err(req, "db_tx_failed", e),
    };
    if let Err(e) = tx.execute("DELETE FROM marks WHERE student_id = ?", [&student_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "marks" })),
        );
    }
    if let Err(e) = tx.execute("DELETE FROM students WHERE id = ?", [&student_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "students" })),
        );
    }
    if let Err(e) = tx.commit() {
        return db_err(req, "db_commit_failed", e);
    }

    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.list" => Some(handle_students_list(state, req)),
        "students.create" => Some(handle_students_create(state, req)),
        "students.update" => Some(handle_students_update(state, req)),
        "students.delete" => Some(handle_students_delete(state, req)),
        _ => None,
    }
}
