use crate::calc::{percent_of, validate_marks, ClassKey, RawScore};
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::handlers::grading::load_active_scale;
use crate::ipc::handlers::students::load_student;
use crate::ipc::helpers::{
    db_conn, db_err, optional_str, parse_academic_year, parse_class_key, parse_term, required_str,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::HashMap;
use uuid::Uuid;

/// Bulk writes above this size are refused outright.
const BULK_LIMIT: usize = 5000;

#[derive(Debug, Clone)]
struct MarkEntry {
    student_id: String,
    subject_id: String,
    marks: f64,
}

/// Raw marks of one class key, grouped per student in subject display order.
pub fn load_class_marks(
    conn: &Connection,
    key: &ClassKey,
) -> rusqlite::Result<HashMap<String, Vec<RawScore>>> {
    let mut stmt = conn.prepare(
        "SELECT m.student_id, m.subject_id, m.raw_marks
         FROM marks m
         LEFT JOIN subjects s ON s.id = m.subject_id
         WHERE m.grade = ? AND m.term = ? AND m.academic_year = ?
         ORDER BY s.sort_order, s.label, m.subject_id",
    )?;
    let rows = stmt
        .query_map((&key.grade, key.term, key.academic_year), |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, f64>(2)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut out: HashMap<String, Vec<RawScore>> = HashMap::new();
    for (student_id, subject_id, marks) in rows {
        out.entry(student_id)
            .or_default()
            .push(RawScore { subject_id, marks });
    }
    Ok(out)
}

fn subject_max_marks(conn: &Connection) -> rusqlite::Result<HashMap<String, u32>> {
    let mut stmt = conn.prepare("SELECT id, max_marks FROM subjects")?;
    let rows = stmt
        .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, u32>(1)?)))?
        .collect::<Result<HashMap<_, _>, _>>();
    rows
}

fn parse_entry(v: &serde_json::Value) -> Result<MarkEntry, String> {
    let student_id = v
        .get("studentId")
        .and_then(|x| x.as_str())
        .ok_or("entry missing studentId")?;
    let subject_id = v
        .get("subjectId")
        .and_then(|x| x.as_str())
        .ok_or("entry missing subjectId")?;
    let marks = v
        .get("marks")
        .and_then(|x| x.as_f64())
        .ok_or("entry marks must be a number")?;
    Ok(MarkEntry {
        student_id: student_id.to_string(),
        subject_id: subject_id.to_string(),
        marks,
    })
}

/// Checks every entry against the catalog and enrollment. Returns the grade
/// each student is currently enrolled in, or the list of rejected entries.
fn validate_entries(
    conn: &Connection,
    entries: &[MarkEntry],
) -> Result<Result<HashMap<String, String>, Vec<serde_json::Value>>, rusqlite::Error> {
    let max_by_subject = subject_max_marks(conn)?;
    let mut grade_by_student: HashMap<String, String> = HashMap::new();
    let mut problems = Vec::new();

    for (i, e) in entries.iter().enumerate() {
        if !grade_by_student.contains_key(&e.student_id) {
            match load_student(conn, &e.student_id)? {
                Some(s) => {
                    grade_by_student.insert(s.id, s.grade);
                }
                None => {
                    problems.push(json!({
                        "index": i,
                        "studentId": e.student_id,
                        "reason": "unknown_student"
                    }));
                    continue;
                }
            }
        }
        let Some(max_marks) = max_by_subject.get(&e.subject_id).copied() else {
            problems.push(json!({
                "index": i,
                "subjectId": e.subject_id,
                "reason": "unknown_subject"
            }));
            continue;
        };
        if !validate_marks(e.marks, max_marks) {
            problems.push(json!({
                "index": i,
                "studentId": e.student_id,
                "subjectId": e.subject_id,
                "marks": e.marks,
                "maxMarks": max_marks,
                "reason": "out_of_range"
            }));
        }
    }

    if problems.is_empty() {
        Ok(Ok(grade_by_student))
    } else {
        Ok(Err(problems))
    }
}

/// Class grade a mark for (`term`, `academic_year`) is filed under.
///
/// Marks the student already holds for that term fix the grade, so one term
/// record never spans two classes. Otherwise `explicit` wins over the current
/// enrollment. `Ok(Err(recorded))` means `explicit` names a different grade
/// than the one already recorded.
fn filing_grade(
    conn: &Connection,
    student_id: &str,
    enrolled_grade: &str,
    explicit: Option<&str>,
    term: i64,
    academic_year: i64,
) -> rusqlite::Result<Result<String, String>> {
    let recorded: Option<String> = conn
        .query_row(
            "SELECT grade FROM marks
             WHERE student_id = ? AND term = ? AND academic_year = ?
             LIMIT 1",
            (student_id, term, academic_year),
            |r| r.get(0),
        )
        .optional()?;
    Ok(match (recorded, explicit) {
        (Some(recorded), Some(g)) if recorded != g => Err(recorded),
        (Some(recorded), _) => Ok(recorded),
        (None, Some(g)) => Ok(g.to_string()),
        (None, None) => Ok(enrolled_grade.to_string()),
    })
}

fn grade_conflict(req: &Request, student_id: &str, recorded: &str) -> serde_json::Value {
    err(
        &req.id,
        "conflict",
        format!("marks for this term are already filed under {}", recorded),
        Some(json!({ "studentId": student_id, "recordedGrade": recorded })),
    )
}

/// Band of a single mark under the active scale, for the mark-entry echo.
fn mark_band(conn: &Connection, req: &Request, entry: &MarkEntry) -> Option<String> {
    let max_marks = subject_max_marks(conn).ok()?.get(&entry.subject_id).copied()?;
    let (scale, _) = load_active_scale(conn, req).ok()?;
    let percentage = percent_of(entry.marks, f64::from(max_marks));
    Some(scale.classify_or_lowest(f64::from(percentage)).letter.clone())
}

fn upsert_mark(
    conn: &Connection,
    entry: &MarkEntry,
    grade: &str,
    term: i64,
    academic_year: i64,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO marks(id, student_id, subject_id, grade, term, academic_year, raw_marks, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(student_id, subject_id, term, academic_year) DO UPDATE SET
           raw_marks = excluded.raw_marks,
           updated_at = excluded.updated_at",
        (
            Uuid::new_v4().to_string(),
            &entry.student_id,
            &entry.subject_id,
            grade,
            term,
            academic_year,
            entry.marks,
            db::now_stamp(),
        ),
    )?;
    Ok(())
}

fn handle_marks_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let key = match parse_class_key(req) {
        Ok(k) => k,
        Err(e) => return e,
    };

    let mut stmt = match conn.prepare(
        "SELECT student_id, subject_id, raw_marks, updated_at
         FROM marks
         WHERE grade = ? AND term = ? AND academic_year = ?
         ORDER BY student_id, subject_id",
    ) {
        Ok(s) => s,
        Err(e) => return db_err(req, "db_query_failed", e),
    };
    let rows = stmt
        .query_map((&key.grade, key.term, key.academic_year), |r| {
            let student_id: String = r.get(0)?;
            let subject_id: String = r.get(1)?;
            let raw_marks: f64 = r.get(2)?;
            let updated_at: Option<String> = r.get(3)?;
            Ok(json!({
                "studentId": student_id,
                "subjectId": subject_id,
                "marks": raw_marks,
                "updatedAt": updated_at
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(marks) => ok(&req.id, json!({ "marks": marks })),
        Err(e) => db_err(req, "db_query_failed", e),
    }
}

fn handle_marks_upsert(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let term = match parse_term(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let academic_year = match parse_academic_year(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let entry = match parse_entry(&req.params) {
        Ok(e) => e,
        Err(msg) => return err(&req.id, "bad_params", msg, None),
    };

    let explicit_grade = match optional_str(req, "grade") {
        Ok(v) => v.filter(|g| !g.is_empty()),
        Err(e) => return e,
    };

    let grades = match validate_entries(conn, std::slice::from_ref(&entry)) {
        Ok(Ok(g)) => g,
        Ok(Err(problems)) => {
            return err(
                &req.id,
                "invalid_mark",
                "mark rejected",
                Some(json!({ "rejected": problems })),
            )
        }
        Err(e) => return db_err(req, "db_query_failed", e),
    };
    let Some(enrolled) = grades.get(&entry.student_id) else {
        return err(&req.id, "not_found", "student not found", None);
    };
    let grade = match filing_grade(
        conn,
        &entry.student_id,
        enrolled,
        explicit_grade.as_deref(),
        term,
        academic_year,
    ) {
        Ok(Ok(g)) => g,
        Ok(Err(recorded)) => return grade_conflict(req, &entry.student_id, &recorded),
        Err(e) => return db_err(req, "db_query_failed", e),
    };

    if let Err(e) = upsert_mark(conn, &entry, &grade, term, academic_year) {
        return db_err(req, "db_update_failed", e);
    }
    ok(
        &req.id,
        json!({
            "ok": true,
            "grade": grade,
            "band": mark_band(conn, req, &entry)
        }),
    )
}

fn handle_marks_bulk_upsert(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let term = match parse_term(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let academic_year = match parse_academic_year(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(raw_entries) = req.params.get("entries").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "entries must be an array", None);
    };
    let explicit_grade = match optional_str(req, "grade") {
        Ok(v) => v.filter(|g| !g.is_empty()),
        Err(e) => return e,
    };
    if raw_entries.len() > BULK_LIMIT {
        return err(
            &req.id,
            "bad_params",
            format!("entries must contain at most {} items", BULK_LIMIT),
            None,
        );
    }

    let mut entries = Vec::with_capacity(raw_entries.len());
    for (i, v) in raw_entries.iter().enumerate() {
        match parse_entry(v) {
            Ok(e) => entries.push(e),
            Err(msg) => {
                return err(
                    &req.id,
                    "bad_params",
                    msg,
                    Some(json!({ "index": i })),
                )
            }
        }
    }

    let grades = match validate_entries(conn, &entries) {
        Ok(Ok(g)) => g,
        Ok(Err(problems)) => {
            return err(
                &req.id,
                "invalid_mark",
                format!("{} of {} entries rejected", problems.len(), entries.len()),
                Some(json!({ "rejected": problems })),
            )
        }
        Err(e) => return db_err(req, "db_query_failed", e),
    };

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return db_err(req, "db_tx_failed", e),
    };
    for entry in &entries {
        let Some(enrolled) = grades.get(&entry.student_id) else {
            let _ = tx.rollback();
            return err(&req.id, "not_found", "student not found", None);
        };
        let grade = match filing_grade(
            &tx,
            &entry.student_id,
            enrolled,
            explicit_grade.as_deref(),
            term,
            academic_year,
        ) {
            Ok(Ok(g)) => g,
            Ok(Err(recorded)) => {
                let _ = tx.rollback();
                return grade_conflict(req, &entry.student_id, &recorded);
            }
            Err(e) => {
                let _ = tx.rollback();
                return db_err(req, "db_query_failed", e);
            }
        };
        if let Err(e) = upsert_mark(&tx, entry, &grade, term, academic_year) {
            let _ = tx.rollback();
            return db_err(req, "db_update_failed", e);
        }
    }
    if let Err(e) = tx.commit() {
        return db_err(req, "db_commit_failed", e);
    }

    ok(&req.id, json!({ "ok": true, "updated": entries.len() }))
}

fn handle_marks_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let subject_id = match required_str(req, "subjectId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let term = match parse_term(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let academic_year = match parse_academic_year(req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let existing: Option<String> = match conn
        .query_row(
            "SELECT id FROM marks
             WHERE student_id = ? AND subject_id = ? AND term = ? AND academic_year = ?",
            (&student_id, &subject_id, term, academic_year),
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return db_err(req, "db_query_failed", e),
    };
    let Some(mark_id) = existing else {
        return err(&req.id, "not_found", "mark not found", None);
    };

    if let Err(e) = conn.execute("DELETE FROM marks WHERE id = ?", [&mark_id]) {
        return db_err(req, "db_delete_failed", e);
    }
    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "marks.get" => Some(handle_marks_get(state, req)),
        "marks.upsert" => Some(handle_marks_upsert(state, req)),
        "marks.bulkUpsert" => Some(handle_marks_bulk_upsert(state, req)),
        "marks.delete" => Some(handle_marks_delete(state, req)),
        _ => None,
    }
}
