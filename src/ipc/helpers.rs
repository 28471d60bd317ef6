use crate::calc::ClassKey;
use crate::ipc::error::err;
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;

pub fn db_conn<'a>(state: &'a AppState, req: &Request) -> Result<&'a Connection, serde_json::Value> {
    state
        .db
        .as_ref()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

pub fn required_str(req: &Request, key: &str) -> Result<String, serde_json::Value> {
    let Some(v) = req.params.get(key).and_then(|v| v.as_str()) else {
        return Err(err(&req.id, "bad_params", format!("missing {}", key), None));
    };
    let trimmed = v.trim();
    if trimmed.is_empty() {
        return Err(err(
            &req.id,
            "bad_params",
            format!("{} must not be empty", key),
            None,
        ));
    }
    Ok(trimmed.to_string())
}

pub fn optional_str(req: &Request, key: &str) -> Result<Option<String>, serde_json::Value> {
    match req.params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => match v.as_str() {
            Some(s) => Ok(Some(s.trim().to_string())),
            None => Err(err(
                &req.id,
                "bad_params",
                format!("{} must be a string", key),
                None,
            )),
        },
    }
}

pub fn required_i64(req: &Request, key: &str) -> Result<i64, serde_json::Value> {
    req.params
        .get(key)
        .and_then(|v| v.as_i64())
        .ok_or_else(|| {
            err(
                &req.id,
                "bad_params",
                format!("missing or non-integer {}", key),
                None,
            )
        })
}

pub fn parse_term(req: &Request) -> Result<i64, serde_json::Value> {
    let term = required_i64(req, "term")?;
    if !(1..=3).contains(&term) {
        return Err(err(&req.id, "bad_params", "term must be in 1..=3", None));
    }
    Ok(term)
}

pub fn parse_academic_year(req: &Request) -> Result<i64, serde_json::Value> {
    let year = required_i64(req, "academicYear")?;
    if !(1900..=9999).contains(&year) {
        return Err(err(
            &req.id,
            "bad_params",
            "academicYear must be a four-digit year",
            None,
        ));
    }
    Ok(year)
}

pub fn parse_class_key(req: &Request) -> Result<ClassKey, serde_json::Value> {
    Ok(ClassKey {
        grade: required_str(req, "grade")?,
        term: parse_term(req)?,
        academic_year: parse_academic_year(req)?,
    })
}

pub fn db_err(req: &Request, code: &str, e: impl std::fmt::Display) -> serde_json::Value {
    err(&req.id, code, e.to_string(), None)
}

pub fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(f, _) if f.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

pub fn parse_max_marks(req: &Request, v: &serde_json::Value) -> Result<u32, serde_json::Value> {
    match v.as_u64() {
        Some(n) if (1..=1000).contains(&n) => Ok(n as u32),
        _ => Err(err(
            &req.id,
            "bad_params",
            "maxMarks must be an integer in 1..=1000",
            None,
        )),
    }
}
