use crate::error::LifecycleError;
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

/// Business-rule refusals keep their structure on the wire; storage faults are logged.
pub fn lifecycle_err(id: &str, e: LifecycleError) -> serde_json::Value {
    match &e {
        LifecycleError::Db(_) | LifecycleError::Io(_) => {
            tracing::error!(request_id = id, error = %e, "request failed");
        }
        _ => {
            tracing::debug!(request_id = id, code = e.code(), "request refused");
        }
    }
    err(id, e.code(), e.to_string(), e.details())
}
