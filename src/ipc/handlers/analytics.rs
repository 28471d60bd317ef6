use crate::calc::{self, ClassAnalysis, ClassKey, MarkError, RankPolicy, RawScore, StudentInfo};
use crate::ipc::error::{err, ok};
use crate::ipc::handlers::grading::load_active_scale;
use crate::ipc::handlers::marks::load_class_marks;
use crate::ipc::handlers::setup::{load_analysis_settings, StudentScope};
use crate::ipc::handlers::students::{load_student, load_students, StudentRow};
use crate::ipc::handlers::subjects::load_subject_definitions;
use crate::ipc::helpers::{db_conn, db_err, parse_academic_year, parse_class_key, parse_term, required_str};
use crate::ipc::types::{AppState, Request};
use crate::scale::SortedGradeScale;
use rusqlite::Connection;
use serde_json::json;
use std::cmp::Ordering;
use std::collections::HashSet;

pub struct ClassComputation {
    pub key: ClassKey,
    pub scale: SortedGradeScale,
    pub rank_policy: RankPolicy,
    pub student_scope: StudentScope,
    pub analysis: ClassAnalysis,
}

fn mark_err(req: &Request, e: &MarkError) -> serde_json::Value {
    err(&req.id, e.code(), e.to_string(), Some(e.details()))
}

fn student_info(s: &StudentRow) -> StudentInfo {
    StudentInfo {
        student_id: s.id.clone(),
        registration_no: s.registration_no.clone(),
        display_name: s.display_name(),
    }
}

fn class_order(a: &StudentRow, b: &StudentRow) -> Ordering {
    a.sort_order
        .cmp(&b.sort_order)
        .then_with(|| a.last_name.cmp(&b.last_name))
        .then_with(|| a.first_name.cmp(&b.first_name))
        .then_with(|| a.id.cmp(&b.id))
}

fn parse_scope_override(req: &Request) -> Result<Option<StudentScope>, serde_json::Value> {
    match req.params.get("studentScope") {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => v
            .as_str()
            .and_then(StudentScope::parse)
            .map(Some)
            .ok_or_else(|| {
                err(
                    &req.id,
                    "bad_params",
                    "studentScope must be one of: marked, enrolled",
                    None,
                )
            }),
    }
}

fn parse_policy_override(req: &Request) -> Result<Option<RankPolicy>, serde_json::Value> {
    match req.params.get("rankPolicy") {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => v
            .as_str()
            .and_then(RankPolicy::parse)
            .map(Some)
            .ok_or_else(|| {
                err(
                    &req.id,
                    "bad_params",
                    "rankPolicy must be one of: sequential, competition",
                    None,
                )
            }),
    }
}

/// Students that make up the class for `key`, in class order.
///
/// Everyone holding marks for the key is always part of the class, even after
/// moving grade or being deactivated. The enrolled scope adds the active
/// students of the grade who have no marks yet.
fn class_students(
    conn: &Connection,
    key: &ClassKey,
    scope: StudentScope,
    marked_ids: impl Iterator<Item = String>,
) -> rusqlite::Result<Vec<StudentRow>> {
    let mut rows = Vec::new();
    for id in marked_ids {
        if let Some(row) = load_student(conn, &id)? {
            rows.push(row);
        }
    }
    if scope == StudentScope::Enrolled {
        let seen: HashSet<String> = rows.iter().map(|r| r.id.clone()).collect();
        rows.extend(
            load_students(conn, Some(&key.grade), false)?
                .into_iter()
                .filter(|r| !seen.contains(&r.id)),
        );
    }
    rows.sort_by(class_order);
    Ok(rows)
}

/// Loads a class key from the workspace and runs the ranking engine over it.
pub fn compute_class(
    conn: &Connection,
    req: &Request,
    key: ClassKey,
) -> Result<ClassComputation, serde_json::Value> {
    let (scale, _) = load_active_scale(conn, req)?;
    let settings = load_analysis_settings(conn).map_err(|e| db_err(req, "db_query_failed", e))?;
    let student_scope = parse_scope_override(req)?.unwrap_or(settings.student_scope);
    let mut options = settings.options;
    if let Some(policy) = parse_policy_override(req)? {
        options.rank_policy = policy;
    }

    let subjects = load_subject_definitions(conn).map_err(|e| db_err(req, "db_query_failed", e))?;
    let mut marks = load_class_marks(conn, &key).map_err(|e| db_err(req, "db_query_failed", e))?;
    let students = class_students(conn, &key, student_scope, marks.keys().cloned())
        .map_err(|e| db_err(req, "db_query_failed", e))?;

    let mut results = Vec::with_capacity(students.len());
    for s in &students {
        let raw: Vec<RawScore> = marks.remove(&s.id).unwrap_or_default();
        let result = calc::aggregate(&student_info(s), &raw, &subjects, &scale)
            .map_err(|e| mark_err(req, &e))?;
        results.push(result);
    }

    let analysis = calc::analyze(&key, results, &subjects, &scale, &options);
    tracing::debug!(
        grade = %key.grade,
        term = key.term,
        academic_year = key.academic_year,
        students = analysis.metrics.total_students,
        "class ranked"
    );
    Ok(ClassComputation {
        key,
        scale,
        rank_policy: options.rank_policy,
        student_scope,
        analysis,
    })
}

fn handle_class_rank(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let key = match parse_class_key(req) {
        Ok(k) => k,
        Err(e) => return e,
    };
    let computed = match compute_class(conn, req, key) {
        Ok(c) => c,
        Err(e) => return e,
    };

    ok(
        &req.id,
        json!({
            "classKey": computed.key,
            "scale": computed.scale.bands(),
            "rankPolicy": computed.rank_policy.as_str(),
            "studentScope": computed.student_scope.as_str(),
            "ranked": computed.analysis.ranked,
            "metrics": computed.analysis.metrics
        }),
    )
}

fn load_student_marks(
    conn: &Connection,
    student_id: &str,
    term: i64,
    academic_year: i64,
) -> rusqlite::Result<Vec<RawScore>> {
    let mut stmt = conn.prepare(
        "SELECT m.subject_id, m.raw_marks
         FROM marks m
         LEFT JOIN subjects s ON s.id = m.subject_id
         WHERE m.student_id = ? AND m.term = ? AND m.academic_year = ?
         ORDER BY s.sort_order, s.label, m.subject_id",
    )?;
    let rows = stmt
        .query_map((student_id, term, academic_year), |r| {
            Ok(RawScore {
                subject_id: r.get(0)?,
                marks: r.get(1)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>();
    rows
}

fn handle_student_result(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
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

    let student = match load_student(conn, &student_id) {
        Ok(Some(s)) => s,
        Ok(None) => return err(&req.id, "not_found", "student not found", None),
        Err(e) => return db_err(req, "db_query_failed", e),
    };
    let (scale, _) = match load_active_scale(conn, req) {
        Ok(s) => s,
        Err(e) => return e,
    };
    let subjects = match load_subject_definitions(conn) {
        Ok(s) => s,
        Err(e) => return db_err(req, "db_query_failed", e),
    };
    let raw = match load_student_marks(conn, &student_id, term, academic_year) {
        Ok(r) => r,
        Err(e) => return db_err(req, "db_query_failed", e),
    };

    match calc::aggregate(&student_info(&student), &raw, &subjects, &scale) {
        Ok(result) => ok(
            &req.id,
            json!({
                "term": term,
                "academicYear": academic_year,
                "result": result
            }),
        ),
        Err(e) => mark_err(req, &e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "analytics.class.rank" => Some(handle_class_rank(state, req)),
        "analytics.student.result" => Some(handle_student_result(state, req)),
        _ => None,
    }
}
