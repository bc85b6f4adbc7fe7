use crate::gate;
use crate::ipc::helpers::{required_str, to_json, with_config, with_conn};
use crate::ipc::types::{AppState, Request};
use crate::lifecycle;
use serde_json::{json, Value};

fn handle_check_closable(state: &mut AppState, req: &Request) -> Value {
    with_config(state, req, |conn, params, cfg| {
        let trimester_id = required_str(params, "trimesterId")?;
        let t = lifecycle::load_trimester(conn, &trimester_id)?;
        to_json(&gate::check_trimester_closable(conn, &t.period_id, &trimester_id, cfg)?)
    })
}

fn handle_activate(state: &mut AppState, req: &Request) -> Value {
    with_conn(state, req, |conn, params| {
        let trimester_id = required_str(params, "trimesterId")?;
        to_json(&lifecycle::activate_trimester(conn, &trimester_id)?)
    })
}

fn handle_finalize(state: &mut AppState, req: &Request) -> Value {
    with_config(state, req, |conn, params, cfg| {
        let trimester_id = required_str(params, "trimesterId")?;
        to_json(&lifecycle::finalize_trimester(conn, &trimester_id, cfg)?)
    })
}

fn handle_recompute(state: &mut AppState, req: &Request) -> Value {
    with_config(state, req, |conn, params, cfg| {
        let trimester_id = required_str(params, "trimesterId")?;
        let written = lifecycle::recompute_trimester(conn, &trimester_id, cfg)?;
        Ok(json!({ "averagesWritten": written }))
    })
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "trimesters.checkClosable" => Some(handle_check_closable(state, req)),
        "trimesters.activate" => Some(handle_activate(state, req)),
        "trimesters.finalize" => Some(handle_finalize(state, req)),
        "trimesters.recompute" => Some(handle_recompute(state, req)),
        _ => None,
    }
}
