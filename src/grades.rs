use crate::calc::{self, ScopeMode, TrimesterAverage};
use crate::config::{GradingConfig, SCORE_MAX, SCORE_MIN};
use crate::db::now_rfc3339;
use crate::error::{LifecycleError, Result, Violation};
use crate::lifecycle::load_trimester;
use crate::model::{Band, EvaluationType, GradingNature, PeriodState, TrimesterState};
use crate::supplementary::load_period_states;
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

struct OfferingRow {
    period_id: String,
    section_id: String,
    nature: GradingNature,
    estado: String,
}

fn load_offering(conn: &Connection, offering_id: &str) -> Result<OfferingRow> {
    let row: Option<(String, String, String, String)> = conn
        .query_row(
            "SELECT period_id, section_id, nature, estado FROM subject_offerings WHERE id = ?",
            [offering_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .optional()?;
    let Some((period_id, section_id, nature, estado)) = row else {
        return Err(LifecycleError::not_found("offering", offering_id));
    };
    Ok(OfferingRow {
        period_id,
        section_id,
        nature: calc::parse_nature(&nature)?,
        estado,
    })
}

#[derive(Debug, Clone)]
pub struct ScoreInput {
    pub offering_id: String,
    pub student_id: String,
    pub trimester_id: String,
    pub evaluation_type: Option<EvaluationType>,
    pub score: Option<f64>,
    pub qualitative: Option<Band>,
}

/// Collects every reason score entry is closed for this (offering, trimester).
fn entry_blockers(
    conn: &Connection,
    offering: &OfferingRow,
    offering_id: &str,
    trimester_id: &str,
) -> Result<Vec<Violation>> {
    let trimester = load_trimester(conn, trimester_id)?;
    if trimester.period_id != offering.period_id {
        return Err(LifecycleError::BadParams(
            "trimester and offering belong to different periods".into(),
        ));
    }
    let (period_state, _) = load_period_states(conn, &offering.period_id)?;
    let mut violations = Vec::new();
    if period_state != PeriodState::Activo {
        violations.push(Violation::for_entity(
            "period_not_active",
            format!("period is {}", period_state),
            &offering.period_id,
        ));
    }
    if trimester.estado != TrimesterState::Activo {
        violations.push(Violation::for_entity(
            "trimester_not_active",
            format!("trimester {} is {}", trimester.ordinal, trimester.estado),
            trimester_id,
        ));
    }
    if offering.estado != "ACTIVO" {
        violations.push(Violation::for_entity(
            "offering_inactive",
            format!("offering is {}", offering.estado),
            offering_id,
        ));
    }
    Ok(violations)
}

pub fn record_score(conn: &Connection, input: &ScoreInput) -> Result<String> {
    let offering = load_offering(conn, &input.offering_id)?;
    match offering.nature {
        GradingNature::Quantitative => {
            if input.evaluation_type.is_none() {
                return Err(LifecycleError::BadParams(
                    "evaluationType is required for quantitative offerings".into(),
                ));
            }
            let Some(score) = input.score else {
                return Err(LifecycleError::BadParams(
                    "score is required for quantitative offerings".into(),
                ));
            };
            if !(SCORE_MIN..=SCORE_MAX).contains(&score) {
                return Err(LifecycleError::BadParams(format!(
                    "score must be within {}..={}",
                    SCORE_MIN, SCORE_MAX
                )));
            }
            if input.qualitative.is_some() {
                return Err(LifecycleError::BadParams(
                    "qualitative letters are only accepted for qualitative offerings".into(),
                ));
            }
        }
        GradingNature::Qualitative => {
            if input.qualitative.is_none() || input.score.is_some() {
                return Err(LifecycleError::BadParams(
                    "qualitative offerings take a letter (DA, AA, PA, NA) and no numeric score"
                        .into(),
                ));
            }
        }
    }

    let mut violations = entry_blockers(conn, &offering, &input.offering_id, &input.trimester_id)?;
    let enrolled: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM enrollments
             WHERE student_id = ? AND section_id = ? AND period_id = ? AND estado = 'ACTIVO'",
            (&input.student_id, &offering.section_id, &offering.period_id),
            |r| r.get(0),
        )
        .optional()?;
    if enrolled.is_none() {
        violations.push(Violation::for_entity(
            "student_not_enrolled",
            "student has no ACTIVO enrollment in the offering's section",
            &input.student_id,
        ));
    }
    if !violations.is_empty() {
        return Err(LifecycleError::precondition(violations));
    }

    let score_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO grade_scores(id, offering_id, student_id, trimester_id, evaluation_type, score, qualitative, recorded_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &score_id,
            &input.offering_id,
            &input.student_id,
            &input.trimester_id,
            input.evaluation_type.map(|t| t.as_str()),
            input.score,
            input.qualitative.map(|b| b.as_str()),
            now_rfc3339(),
        ),
    )?;
    Ok(score_id)
}

pub fn delete_score(conn: &Connection, score_id: &str) -> Result<()> {
    let row: Option<(String, String)> = conn
        .query_row(
            "SELECT offering_id, trimester_id FROM grade_scores WHERE id = ?",
            [score_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    let Some((offering_id, trimester_id)) = row else {
        return Err(LifecycleError::not_found("score", score_id));
    };
    let offering = load_offering(conn, &offering_id)?;
    let violations = entry_blockers(conn, &offering, &offering_id, &trimester_id)?;
    if !violations.is_empty() {
        return Err(LifecycleError::precondition(violations));
    }
    conn.execute("DELETE FROM grade_scores WHERE id = ?", [score_id])?;
    Ok(())
}

/// `computeTrimesterAverage(student, offering, trimester)`, always from raw scores.
pub fn trimester_average(
    conn: &Connection,
    student_id: &str,
    offering_id: &str,
    trimester_id: &str,
    cfg: &GradingConfig,
) -> Result<TrimesterAverage> {
    let offering = load_offering(conn, offering_id)?;
    let trimester = load_trimester(conn, trimester_id)?;
    if trimester.period_id != offering.period_id {
        return Err(LifecycleError::BadParams(
            "trimester and offering belong to different periods".into(),
        ));
    }
    let weights = calc::load_weights(conn, &offering.period_id)?;
    let scores = calc::load_pair_scores(conn, offering_id, student_id, trimester_id)?;
    let avg = calc::pair_average(offering.nature, &scores, &weights, cfg)?;
    if !calc::is_complete(offering.nature, &avg) {
        let missing: Vec<&str> = match offering.nature {
            GradingNature::Quantitative => avg
                .missing_components()
                .into_iter()
                .map(|t| t.as_str())
                .collect(),
            GradingNature::Qualitative => vec!["CUALITATIVA"],
        };
        return Err(LifecycleError::IncompleteData {
            message: format!("missing {} score", missing.join(", ")),
            details: json!({
                "studentId": student_id,
                "offeringId": offering_id,
                "trimesterId": trimester_id,
                "missing": missing,
                "partial": avg,
            }),
        });
    }
    Ok(avg)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentAverageRow {
    pub student_id: String,
    pub student_name: String,
    #[serde(flatten)]
    pub average: TrimesterAverage,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OfferingSummary {
    pub offering_id: String,
    pub trimester_id: String,
    pub rows: Vec<StudentAverageRow>,
    pub promedios: TrimesterAverage,
}

/// Per-student rows of one offering and trimester plus the course PROMEDIOS row.
/// Incomplete students still get a row, with nulls where components are missing.
pub fn offering_summary(
    conn: &Connection,
    offering_id: &str,
    trimester_id: &str,
    cfg: &GradingConfig,
) -> Result<OfferingSummary> {
    let offering = load_offering(conn, offering_id)?;
    let trimester = load_trimester(conn, trimester_id)?;
    if trimester.period_id != offering.period_id {
        return Err(LifecycleError::BadParams(
            "trimester and offering belong to different periods".into(),
        ));
    }
    let (period_state, _) = load_period_states(conn, &offering.period_id)?;
    let mode = match period_state {
        PeriodState::Activo => ScopeMode::Open,
        PeriodState::Finalizado => ScopeMode::Closed,
    };
    let weights = calc::load_weights(conn, &offering.period_id)?;
    let scores = calc::load_trimester_scores(conn, trimester_id)?;
    let empty = calc::PairScores::default();

    let mut rows = Vec::new();
    for pair in calc::load_scope(conn, &offering.period_id, mode)?
        .into_iter()
        .filter(|p| p.offering_id == offering_id)
    {
        let key = (pair.offering_id.clone(), pair.student_id.clone());
        let average =
            calc::pair_average(pair.nature, scores.get(&key).unwrap_or(&empty), &weights, cfg)?;
        rows.push(StudentAverageRow {
            student_id: pair.student_id,
            student_name: pair.student_name,
            average,
        });
    }
    let averages: Vec<TrimesterAverage> = rows.iter().map(|r| r.average.clone()).collect();
    let promedios = match offering.nature {
        GradingNature::Quantitative => calc::promedios_row(&averages, cfg),
        GradingNature::Qualitative => TrimesterAverage::default(),
    };
    Ok(OfferingSummary {
        offering_id: offering_id.to_string(),
        trimester_id: trimester_id.to_string(),
        rows,
        promedios,
    })
}
