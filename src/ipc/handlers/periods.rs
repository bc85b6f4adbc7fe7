use crate::calc::{self, Weights};
use crate::error::LifecycleError;
use crate::ipc::helpers::{optional_str, required_f64, required_str, to_json, with_config, with_conn};
use crate::ipc::types::{AppState, Request};
use crate::lifecycle;
use crate::snapshot;
use serde_json::{json, Value};
use std::path::PathBuf;

fn parse_weights(v: &Value) -> crate::error::Result<Weights> {
    Ok(Weights {
        insumos: required_f64(v, "insumos")?,
        proyecto: required_f64(v, "proyecto")?,
        examen: required_f64(v, "examen")?,
    })
}

fn handle_periods_list(state: &mut AppState, req: &Request) -> Value {
    with_conn(state, req, |conn, _| {
        Ok(json!({ "periods": to_json(&lifecycle::list_periods(conn)?)? }))
    })
}

fn handle_periods_get(state: &mut AppState, req: &Request) -> Value {
    with_conn(state, req, |conn, params| {
        let period_id = required_str(params, "periodId")?;
        to_json(&lifecycle::get_period(conn, &period_id)?)
    })
}

fn handle_periods_create(state: &mut AppState, req: &Request) -> Value {
    with_conn(state, req, |conn, params| {
        let name = required_str(params, "name")?;
        let start = required_str(params, "startDate")?;
        let end = required_str(params, "endDate")?;
        let weights = match params.get("weights") {
            None | Some(Value::Null) => None,
            Some(w) => Some(parse_weights(w)?),
        };
        to_json(&lifecycle::create_period(conn, &name, &start, &end, weights)?)
    })
}

fn handle_periods_finalize(state: &mut AppState, req: &Request) -> Value {
    let db_path = state.db_path();
    with_config(state, req, |conn, params, cfg| {
        let period_id = required_str(params, "periodId")?;
        let snapshot_out = optional_str(params, "snapshotPath").map(PathBuf::from);
        let target = match (&db_path, &snapshot_out) {
            (Some(db), Some(out)) => Some((db.as_path(), out.as_path())),
            _ => None,
        };
        to_json(&lifecycle::finalize_period(conn, &period_id, cfg, target)?)
    })
}

fn handle_weights_get(state: &mut AppState, req: &Request) -> Value {
    with_conn(state, req, |conn, params| {
        let period_id = required_str(params, "periodId")?;
        let w = calc::load_weights(conn, &period_id)?;
        let valid = w.validate().is_ok();
        Ok(json!({ "weights": w, "total": w.total(), "valid": valid }))
    })
}

fn handle_weights_set(state: &mut AppState, req: &Request) -> Value {
    with_conn(state, req, |conn, params| {
        let period_id = required_str(params, "periodId")?;
        let w = lifecycle::set_weights(conn, &period_id, parse_weights(params)?)?;
        let valid = w.validate().is_ok();
        Ok(json!({ "weights": w, "total": w.total(), "valid": valid }))
    })
}

fn handle_snapshots_verify(state: &mut AppState, req: &Request) -> Value {
    with_conn(state, req, |_, params| {
        let path = PathBuf::from(required_str(params, "path")?);
        let summary = snapshot::verify_snapshot(&path).map_err(LifecycleError::Io)?;
        to_json(&summary)
    })
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "periods.list" => Some(handle_periods_list(state, req)),
        "periods.get" => Some(handle_periods_get(state, req)),
        "periods.create" => Some(handle_periods_create(state, req)),
        "periods.finalize" => Some(handle_periods_finalize(state, req)),
        "weights.get" => Some(handle_weights_get(state, req)),
        "weights.set" => Some(handle_weights_set(state, req)),
        "snapshots.verify" => Some(handle_snapshots_verify(state, req)),
        _ => None,
    }
}
