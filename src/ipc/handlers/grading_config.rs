use crate::config;
use crate::error::LifecycleError;
use crate::ipc::helpers::{to_json, with_conn};
use crate::ipc::types::{AppState, Request};
use serde_json::Value;

fn handle_get(state: &mut AppState, req: &Request) -> Value {
    with_conn(state, req, |conn, _| to_json(&config::load(conn)?))
}

fn handle_update(state: &mut AppState, req: &Request) -> Value {
    with_conn(state, req, |conn, params| {
        let Some(patch) = params.get("patch") else {
            return Err(LifecycleError::BadParams("missing patch".into()));
        };
        to_json(&config::update(conn, patch)?)
    })
}

fn handle_clear_override(state: &mut AppState, req: &Request) -> Value {
    with_conn(state, req, |conn, _| to_json(&config::clear_override(conn)?))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "grading.config.get" => Some(handle_get(state, req)),
        "grading.config.update" => Some(handle_update(state, req)),
        "grading.config.clearOverride" => Some(handle_clear_override(state, req)),
        _ => None,
    }
}
