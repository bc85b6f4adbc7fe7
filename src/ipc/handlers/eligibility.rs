use crate::eligibility;
use crate::ipc::helpers::{required_str, to_json, with_config};
use crate::ipc::types::{AppState, Request};
use serde_json::Value;

fn handle_evaluate(state: &mut AppState, req: &Request) -> Value {
    with_config(state, req, |conn, params, cfg| {
        let student_id = required_str(params, "studentId")?;
        let period_id = required_str(params, "periodId")?;
        to_json(&eligibility::evaluate_student(conn, &student_id, &period_id, cfg)?)
    })
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "eligibility.evaluate" => Some(handle_evaluate(state, req)),
        _ => None,
    }
}
