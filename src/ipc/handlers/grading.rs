use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, db_err};
use crate::ipc::types::{AppState, Request};
use crate::scale::{GradeBand, ScaleError, SortedGradeScale};
use rusqlite::Connection;
use serde_json::json;

const SCALE_KEY: &str = "grading.scale";

fn scale_err(req: &Request, e: &ScaleError) -> serde_json::Value {
    err(&req.id, e.code(), e.to_string(), None)
}

/// Workspace scale, or the CBC default when none has been saved.
///
/// A saved scale that no longer validates is an error, not a reason to fall
/// back: ranking against a different scale would silently change grades.
pub fn load_active_scale(
    conn: &Connection,
    req: &Request,
) -> Result<(SortedGradeScale, bool), serde_json::Value> {
    let saved = db::settings_get_json(conn, SCALE_KEY)
        .map_err(|e| db_err(req, "db_query_failed", e))?;
    let Some(saved) = saved else {
        return Ok((SortedGradeScale::cbc_default(), false));
    };
    let scale: SortedGradeScale = serde_json::from_value(saved).map_err(|e| {
        err(
            &req.id,
            "invalid_scale",
            format!("stored grade scale is invalid: {}", e),
            None,
        )
    })?;
    Ok((scale, true))
}

fn scale_json(scale: &SortedGradeScale, custom: bool) -> serde_json::Value {
    json!({
        "bands": scale.bands(),
        "custom": custom,
        "passingLetters": scale.passing_letters()
    })
}

fn handle_scale_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    match load_active_scale(conn, req) {
        Ok((scale, custom)) => ok(&req.id, scale_json(&scale, custom)),
        Err(e) => e,
    }
}

fn handle_scale_set(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let Some(raw) = req.params.get("bands") else {
        return err(&req.id, "bad_params", "missing bands", None);
    };
    let bands: Vec<GradeBand> = match serde_json::from_value(raw.clone()) {
        Ok(b) => b,
        Err(e) => {
            return err(
                &req.id,
                "bad_params",
                format!("bands must be a list of grade bands: {}", e),
                None,
            )
        }
    };
    let scale = match SortedGradeScale::new(bands) {
        Ok(s) => s,
        Err(e) => return scale_err(req, &e),
    };

    if let Err(e) = db::settings_set_json(conn, SCALE_KEY, &json!(scale.bands())) {
        return db_err(req, "db_update_failed", e);
    }
    tracing::info!(bands = scale.bands().len(), "grade scale updated");
    ok(&req.id, scale_json(&scale, true))
}

fn handle_scale_reset(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    if let Err(e) = db::settings_delete(conn, SCALE_KEY) {
        return db_err(req, "db_delete_failed", e);
    }
    ok(&req.id, scale_json(&SortedGradeScale::cbc_default(), false))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "scale.get" => Some(handle_scale_get(state, req)),
        "scale.set" => Some(handle_scale_set(state, req)),
        "scale.reset" => Some(handle_scale_reset(state, req)),
        _ => None,
    }
}
