use crate::calc::SubjectDefinition;
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, db_err, is_constraint_violation, parse_max_marks, required_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

/// Subject catalog in display order.
pub fn load_subject_definitions(conn: &Connection) -> rusqlite::Result<Vec<SubjectDefinition>> {
    let mut stmt = conn.prepare(
        "SELECT id, label, max_marks
         FROM subjects
         ORDER BY sort_order, label",
    )?;
    let rows = stmt
        .query_map([], |r| {
            Ok(SubjectDefinition {
                id: r.get(0)?,
                label: r.get(1)?,
                max_marks: r.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>();
    rows
}

fn handle_subjects_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "subjects": [] }));
    };

    let mut stmt = match conn.prepare(
        "SELECT
           s.id,
           s.label,
           s.max_marks,
           s.sort_order,
           (SELECT COUNT(*) FROM marks m WHERE m.subject_id = s.id) AS mark_count
         FROM subjects s
         ORDER BY s.sort_order, s.label",
    ) {
        Ok(s) => s,
        Err(e) => return db_err(req, "db_query_failed", e),
    };
    let rows = stmt
        .query_map([], |r| {
            let id: String = r.get(0)?;
            let label: String = r.get(1)?;
            let max_marks: i64 = r.get(2)?;
            let sort_order: i64 = r.get(3)?;
            let mark_count: i64 = r.get(4)?;
            Ok(json!({
                "id": id,
                "label": label,
                "maxMarks": max_marks,
                "sortOrder": sort_order,
                "markCount": mark_count
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(subjects) => ok(&req.id, json!({ "subjects": subjects })),
        Err(e) => db_err(req, "db_query_failed", e),
    }
}

fn handle_subjects_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let label = match required_str(req, "label") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(max_raw) = req.params.get("maxMarks") else {
        return err(&req.id, "bad_params", "missing maxMarks", None);
    };
    let max_marks = match parse_max_marks(req, max_raw) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let sort_order = match req.params.get("sortOrder") {
        Some(v) if !v.is_null() => match v.as_i64() {
            Some(n) => n,
            None => return err(&req.id, "bad_params", "sortOrder must be integer", None),
        },
        _ => {
            let next: rusqlite::Result<i64> = conn.query_row(
                "SELECT COALESCE(MAX(sort_order) + 1, 0) FROM subjects",
                [],
                |r| r.get(0),
            );
            match next {
                Ok(n) => n,
                Err(e) => return db_err(req, "db_query_failed", e),
            }
        }
    };

    let subject_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO subjects(id, label, max_marks, sort_order, updated_at) VALUES(?, ?, ?, ?, ?)",
        (&subject_id, &label, max_marks, sort_order, db::now_stamp()),
    ) {
        if is_constraint_violation(&e) {
            return err(
                &req.id,
                "conflict",
                format!("a subject labelled {:?} already exists", label),
                None,
            );
        }
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "subjects" })),
        );
    }

    ok(
        &req.id,
        json!({
            "subjectId": subject_id,
            "label": label,
            "maxMarks": max_marks,
            "sortOrder": sort_order
        }),
    )
}

fn handle_subjects_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let subject_id = match required_str(req, "subjectId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(patch) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "patch must be an object", None);
    };

    let current: Option<(String, u32, i64)> = match conn
        .query_row(
            "SELECT label, max_marks, sort_order FROM subjects WHERE id = ?",
            [&subject_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return db_err(req, "db_query_failed", e),
    };
    let Some((mut label, mut max_marks, mut sort_order)) = current else {
        return err(&req.id, "not_found", "subject not found", None);
    };

    for (k, v) in patch {
        match k.as_str() {
            "label" => {
                let Some(s) = v.as_str().map(str::trim).filter(|s| !s.is_empty()) else {
                    return err(&req.id, "bad_params", "label must be a non-empty string", None);
                };
                label = s.to_string();
            }
            "maxMarks" => {
                max_marks = match parse_max_marks(req, v) {
                    Ok(n) => n,
                    Err(e) => return e,
                };
            }
            "sortOrder" => {
                let Some(n) = v.as_i64() else {
                    return err(&req.id, "bad_params", "sortOrder must be integer", None);
                };
                sort_order = n;
            }
            _ => return err(&req.id, "bad_params", format!("unknown subject field: {}", k), None),
        }
    }

    // Lowering maxMarks must not strand marks above the new maximum.
    let over: i64 = match conn.query_row(
        "SELECT COUNT(*) FROM marks WHERE subject_id = ? AND raw_marks > ?",
        (&subject_id, max_marks),
        |r| r.get(0),
    ) {
        Ok(n) => n,
        Err(e) => return db_err(req, "db_query_failed", e),
    };
    if over > 0 {
        return err(
            &req.id,
            "conflict",
            "existing marks exceed the new maxMarks",
            Some(json!({ "marksAboveMax": over, "maxMarks": max_marks })),
        );
    }

    if let Err(e) = conn.execute(
        "UPDATE subjects SET label = ?, max_marks = ?, sort_order = ?, updated_at = ? WHERE id = ?",
        (&label, max_marks, sort_order, db::now_stamp(), &subject_id),
    ) {
        if is_constraint_violation(&e) {
            return err(
                &req.id,
                "conflict",
                format!("a subject labelled {:?} already exists", label),
                None,
            );
        }
        return db_err(req, "db_update_failed", e);
    }

    ok(
        &req.id,
        json!({
            "subjectId": subject_id,
            "label": label,
            "maxMarks": max_marks,
            "sortOrder": sort_order
        }),
    )
}

fn handle_subjects_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let subject_id = match required_str(req, "subjectId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM subjects WHERE id = ?", [&subject_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return db_err(req, "db_query_failed", e),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "subject not found", None);
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return db_err(req, "db_tx_failed", e),
    };
    let removed_marks = match tx.execute("DELETE FROM marks WHERE subject_id = ?", [&subject_id]) {
        Ok(n) => n,
        Err(e) => {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_delete_failed",
                e.to_string(),
                Some(json!({ "table": "marks" })),
            );
        }
    };
    if let Err(e) = tx.execute("DELETE FROM subjects WHERE id = ?", [&subject_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "subjects" })),
        );
    }
    if let Err(e) = tx.commit() {
        return db_err(req, "db_commit_failed", e);
    }

    ok(&req.id, json!({ "ok": true, "removedMarks": removed_marks }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "subjects.list" => Some(handle_subjects_list(state, req)),
        "subjects.create" => Some(handle_subjects_create(state, req)),
        "subjects.update" => Some(handle_subjects_update(state, req)),
        "subjects.delete" => Some(handle_subjects_delete(state, req)),
        _ => None,
    }
}
