use crate::calc;
use crate::ipc::error::{err, ok};
use crate::ipc::handlers::analytics::compute_class;
use crate::ipc::handlers::students::load_student;
use crate::ipc::helpers::{db_conn, db_err, optional_str, parse_academic_year, parse_term, required_str};
use crate::ipc::types::{AppState, Request};
use serde_json::json;

fn handle_report_card(state: &mut AppState, req: &Request) -> serde_json::Value {
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

    // The card is ranked within the grade the student sat in; default to the
    // current enrollment when the caller does not say.
    let grade = match optional_str(req, "grade") {
        Ok(Some(g)) if !g.is_empty() => g,
        Ok(_) => match load_student(conn, &student_id) {
            Ok(Some(s)) => s.grade,
            Ok(None) => return err(&req.id, "not_found", "student not found", None),
            Err(e) => return db_err(req, "db_query_failed", e),
        },
        Err(e) => return e,
    };

    let key = calc::ClassKey {
        grade,
        term,
        academic_year,
    };
    let computed = match compute_class(conn, req, key) {
        Ok(c) => c,
        Err(e) => return e,
    };

    match calc::report_card(&computed.analysis, &student_id) {
        Some(card) => ok(&req.id, json!({ "reportCard": card })),
        None => err(
            &req.id,
            "not_found",
            "student has no result for this grade, term and year",
            None,
        ),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "reports.reportCard" => Some(handle_report_card(state, req)),
        _ => None,
    }
}
