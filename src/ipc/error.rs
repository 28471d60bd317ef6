use serde_json::json;

pub fn ok(id: &str, result: serde_json::Value) -> serde_json::Value {
    json!({
        "id": id,
        "ok": true,
        "result": result
    })
}

pub fn err(
    id: &str,
    code: &str,
    message: impl Into<String>,
    details: Option<serde_json::Value>,
) -> serde_json::Value {
    let mut error = json!({
        "code": code,
        "message": message.into(),
    });
    if let Some(d) = details {
        error["details"] = d;
    }
    json!({
        "id": id,
        "ok": false,
        "error": error,
    })
}

/// Error code of a response envelope, if it is a failure.
pub fn error_code(resp: &serde_json::Value) -> Option<&str> {
    if resp.get("ok").and_then(|v| v.as_bool()) != Some(false) {
        return None;
    }
    resp.get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
}
