use crate::config::{self, GradingConfig};
use crate::error::{LifecycleError, Result};
use crate::ipc::error::{err, lifecycle_err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde::Serialize;
use serde_json::Value;

pub fn required_str(params: &Value, key: &str) -> Result<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| LifecycleError::BadParams(format!("missing {}", key)))
}

pub fn optional_str(params: &Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

pub fn optional_f64(params: &Value, key: &str) -> Result<Option<f64>> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_f64()
            .map(Some)
            .ok_or_else(|| LifecycleError::BadParams(format!("{} must be a number", key))),
    }
}

pub fn required_f64(params: &Value, key: &str) -> Result<f64> {
    optional_f64(params, key)?.ok_or_else(|| LifecycleError::BadParams(format!("missing {}", key)))
}

/// Parses a wire code such as `"ACTIVADO"` with the enum's own `parse`.
pub fn optional_code<T>(params: &Value, key: &str, parse: fn(&str) -> Option<T>) -> Result<Option<T>> {
    let Some(raw) = optional_str(params, key) else {
        return Ok(None);
    };
    parse(&raw)
        .map(Some)
        .ok_or_else(|| LifecycleError::BadParams(format!("unknown {}: {}", key, raw)))
}

pub fn required_code<T>(params: &Value, key: &str, parse: fn(&str) -> Option<T>) -> Result<T> {
    optional_code(params, key, parse)?
        .ok_or_else(|| LifecycleError::BadParams(format!("missing {}", key)))
}

pub fn to_json<T: Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| LifecycleError::Io(e.into()))
}

/// Runs a handler body against the open workspace and wraps the outcome.
pub fn with_conn<F>(state: &AppState, req: &Request, body: F) -> Value
where
    F: FnOnce(&Connection, &Value) -> Result<Value>,
{
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match body(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(e) => lifecycle_err(&req.id, e),
    }
}

/// Like [`with_conn`], with the workspace's grading config loaded for this request.
pub fn with_config<F>(state: &AppState, req: &Request, body: F) -> Value
where
    F: FnOnce(&Connection, &Value, &GradingConfig) -> Result<Value>,
{
    with_conn(state, req, |conn, params| {
        let cfg = config::load(conn)?;
        body(conn, params, &cfg)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SupplementaryState;
    use serde_json::json;

    #[test]
    fn param_readers_report_bad_params() {
        let p = json!({ "a": " x ", "n": "7", "t": "activado", "blank": "  " });
        assert_eq!(required_str(&p, "a").expect("a"), "x");
        assert_eq!(required_str(&p, "blank").expect_err("blank").code(), "bad_params");
        assert!(required_f64(&p, "n").is_err());
        assert_eq!(
            required_code(&p, "t", SupplementaryState::parse).expect("code"),
            SupplementaryState::Activado
        );
        assert!(optional_code(&p, "missing", SupplementaryState::parse)
            .expect("absent")
            .is_none());
    }
}
