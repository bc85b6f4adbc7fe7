use crate::ipc::helpers::{required_str, with_conn};
use crate::ipc::types::{AppState, Request};
use crate::lifecycle;
use serde_json::{json, Value};

fn handle_withdraw(state: &mut AppState, req: &Request) -> Value {
    with_conn(state, req, |conn, params| {
        let enrollment_id = required_str(params, "enrollmentId")?;
        let reason = required_str(params, "reason")?;
        lifecycle::withdraw_enrollment(conn, &enrollment_id, &reason)?;
        Ok(json!({ "ok": true }))
    })
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "enrollments.withdraw" => Some(handle_withdraw(state, req)),
        _ => None,
    }
}
