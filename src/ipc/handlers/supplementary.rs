use crate::ipc::helpers::{required_code, required_f64, required_str, to_json, with_config};
use crate::ipc::types::{AppState, Request};
use crate::model::SupplementaryState;
use crate::supplementary;
use serde_json::{json, Value};

fn handle_transition(state: &mut AppState, req: &Request) -> Value {
    with_config(state, req, |conn, params, cfg| {
        let period_id = required_str(params, "periodId")?;
        let target = required_code(params, "target", SupplementaryState::parse)?;
        to_json(&supplementary::transition(conn, &period_id, target, cfg)?)
    })
}

fn handle_list(state: &mut AppState, req: &Request) -> Value {
    with_config(state, req, |conn, params, cfg| {
        let period_id = required_str(params, "periodId")?;
        let rows = supplementary::list(conn, &period_id, cfg)?;
        Ok(json!({ "rows": to_json(&rows)? }))
    })
}

fn handle_record_score(state: &mut AppState, req: &Request) -> Value {
    with_config(state, req, |conn, params, cfg| {
        let period_id = required_str(params, "periodId")?;
        let offering_id = required_str(params, "offeringId")?;
        let student_id = required_str(params, "studentId")?;
        let score = required_f64(params, "score")?;
        to_json(&supplementary::record_score(
            conn,
            &period_id,
            &offering_id,
            &student_id,
            score,
            cfg,
        )?)
    })
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "supplementary.transition" => Some(handle_transition(state, req)),
        "supplementary.list" => Some(handle_list(state, req)),
        "supplementary.recordScore" => Some(handle_record_score(state, req)),
        _ => None,
    }
}
