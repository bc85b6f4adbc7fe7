use crate::grades::{self, ScoreInput};
use crate::ipc::helpers::{optional_code, optional_f64, required_str, to_json, with_config, with_conn};
use crate::ipc::types::{AppState, Request};
use crate::model::{Band, EvaluationType};
use serde_json::{json, Value};

fn handle_scores_record(state: &mut AppState, req: &Request) -> Value {
    with_conn(state, req, |conn, params| {
        let input = ScoreInput {
            offering_id: required_str(params, "offeringId")?,
            student_id: required_str(params, "studentId")?,
            trimester_id: required_str(params, "trimesterId")?,
            evaluation_type: optional_code(params, "evaluationType", EvaluationType::parse)?,
            score: optional_f64(params, "score")?,
            qualitative: optional_code(params, "qualitative", Band::parse)?,
        };
        let score_id = grades::record_score(conn, &input)?;
        Ok(json!({ "scoreId": score_id }))
    })
}

fn handle_scores_delete(state: &mut AppState, req: &Request) -> Value {
    with_conn(state, req, |conn, params| {
        let score_id = required_str(params, "scoreId")?;
        grades::delete_score(conn, &score_id)?;
        Ok(json!({ "ok": true }))
    })
}

fn handle_trimester_average(state: &mut AppState, req: &Request) -> Value {
    with_config(state, req, |conn, params, cfg| {
        let student_id = required_str(params, "studentId")?;
        let offering_id = required_str(params, "offeringId")?;
        let trimester_id = required_str(params, "trimesterId")?;
        to_json(&grades::trimester_average(
            conn,
            &student_id,
            &offering_id,
            &trimester_id,
            cfg,
        )?)
    })
}

fn handle_offering_summary(state: &mut AppState, req: &Request) -> Value {
    with_config(state, req, |conn, params, cfg| {
        let offering_id = required_str(params, "offeringId")?;
        let trimester_id = required_str(params, "trimesterId")?;
        to_json(&grades::offering_summary(conn, &offering_id, &trimester_id, cfg)?)
    })
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "scores.record" => Some(handle_scores_record(state, req)),
        "scores.delete" => Some(handle_scores_delete(state, req)),
        "grades.trimesterAverage" => Some(handle_trimester_average(state, req)),
        "grades.offeringSummary" => Some(handle_offering_summary(state, req)),
        _ => None,
    }
}
