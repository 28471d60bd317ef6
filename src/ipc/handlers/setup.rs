use crate::calc::{AnalysisOptions, RankPolicy};
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, db_err};
use crate::ipc::types::{AppState, Request};
use serde_json::{json, Map, Value};

const ANALYSIS_KEY: &str = "setup.analysis";

/// Which students make up a class for ranking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StudentScope {
    /// Students holding at least one mark for the class key.
    Marked,
    /// Every active student enrolled in the grade, marked or not.
    Enrolled,
}

impl StudentScope {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "marked" => Some(Self::Marked),
            "enrolled" => Some(Self::Enrolled),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Marked => "marked",
            Self::Enrolled => "enrolled",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AnalysisSettings {
    pub options: AnalysisOptions,
    pub student_scope: StudentScope,
}

fn default_analysis() -> Value {
    let d = AnalysisOptions::default();
    json!({
        "rankPolicy": d.rank_policy.as_str(),
        "performerCount": d.performer_count,
        "highlightCount": d.highlight_count,
        "defaultStudentScope": StudentScope::Marked.as_str()
    })
}

fn parse_i64_range(v: &Value, key: &str, min: i64, max: i64) -> Result<i64, String> {
    let n = v
        .as_i64()
        .ok_or_else(|| format!("{} must be integer", key))?;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

fn merge_analysis_patch(current: &mut Value, patch: &Map<String, Value>) -> Result<(), String> {
    let obj = current
        .as_object_mut()
        .ok_or_else(|| "internal setup object must be a JSON object".to_string())?;
    for (k, v) in patch {
        match k.as_str() {
            "rankPolicy" => {
                let s = v
                    .as_str()
                    .map(|s| s.trim().to_ascii_lowercase())
                    .ok_or_else(|| "rankPolicy must be string".to_string())?;
                let Some(policy) = RankPolicy::parse(&s) else {
                    return Err("rankPolicy must be one of: sequential, competition".into());
                };
                obj.insert(k.clone(), Value::String(policy.as_str().to_string()));
            }
            "performerCount" => {
                obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 1, 50)?));
            }
            "highlightCount" => {
                obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 1, 20)?));
            }
            "defaultStudentScope" => {
                let s = v
                    .as_str()
                    .map(|s| s.trim().to_ascii_lowercase())
                    .ok_or_else(|| "defaultStudentScope must be string".to_string())?;
                let Some(scope) = StudentScope::parse(&s) else {
                    return Err("defaultStudentScope must be one of: marked, enrolled".into());
                };
                obj.insert(k.clone(), Value::String(scope.as_str().to_string()));
            }
            _ => return Err(format!("unknown analysis field: {}", k)),
        }
    }
    Ok(())
}

fn load_analysis_value(conn: &rusqlite::Connection) -> anyhow::Result<Value> {
    let mut current = default_analysis();
    if let Some(saved) = db::settings_get_json(conn, ANALYSIS_KEY)? {
        if let Some(saved_obj) = saved.as_object() {
            // Best-effort apply: malformed historical values fall back to defaults.
            if let Err(msg) = merge_analysis_patch(&mut current, saved_obj) {
                tracing::warn!(%msg, "ignoring stored analysis settings");
                current = default_analysis();
            }
        }
    }
    Ok(current)
}

fn settings_from_value(v: &Value) -> AnalysisSettings {
    let d = AnalysisOptions::default();
    let rank_policy = v
        .get("rankPolicy")
        .and_then(|x| x.as_str())
        .and_then(RankPolicy::parse)
        .unwrap_or(d.rank_policy);
    let performer_count = v
        .get("performerCount")
        .and_then(|x| x.as_u64())
        .map(|n| n as usize)
        .unwrap_or(d.performer_count);
    let highlight_count = v
        .get("highlightCount")
        .and_then(|x| x.as_u64())
        .map(|n| n as usize)
        .unwrap_or(d.highlight_count);
    let student_scope = v
        .get("defaultStudentScope")
        .and_then(|x| x.as_str())
        .and_then(StudentScope::parse)
        .unwrap_or(StudentScope::Marked);
    AnalysisSettings {
        options: AnalysisOptions {
            rank_policy,
            performer_count,
            highlight_count,
        },
        student_scope,
    }
}

pub fn load_analysis_settings(conn: &rusqlite::Connection) -> anyhow::Result<AnalysisSettings> {
    Ok(settings_from_value(&load_analysis_value(conn)?))
}

fn handle_settings_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    match load_analysis_value(conn) {
        Ok(analysis) => ok(&req.id, json!({ "analysis": analysis })),
        Err(e) => db_err(req, "db_query_failed", e),
    }
}

fn handle_settings_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let Some(patch_obj) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "patch must be an object", None);
    };

    let mut current = match load_analysis_value(conn) {
        Ok(v) => v,
        Err(e) => return db_err(req, "db_query_failed", e),
    };
    if let Err(msg) = merge_analysis_patch(&mut current, patch_obj) {
        return err(&req.id, "bad_params", msg, None);
    }
    if let Err(e) = db::settings_set_json(conn, ANALYSIS_KEY, &current) {
        return db_err(req, "db_update_failed", e);
    }
    ok(&req.id, json!({ "analysis": current }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "settings.get" => Some(handle_settings_get(state, req)),
        "settings.update" => Some(handle_settings_update(state, req)),
        _ => None,
    }
}
