use crate::calc::{self, ScopeMode};
use crate::config::{GradingConfig, SCORE_MAX, SCORE_MIN};
use crate::db::now_rfc3339;
use crate::error::{LifecycleError, Result, Violation};
use crate::model::{GradingNature, PeriodState, SupplementaryState};
use crate::transitions;
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionOutcome {
    pub period_id: String,
    pub from: SupplementaryState,
    pub to: SupplementaryState,
    /// Only set when the move recomputed eligibility (PENDIENTE -> ACTIVADO).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eligible_count: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SupplementaryRow {
    pub offering_id: String,
    pub subject_name: String,
    pub student_id: String,
    pub student_name: String,
    pub annual_average: Option<f64>,
    pub score: Option<f64>,
    pub passed: Option<bool>,
}

pub fn in_window(annual: f64, cfg: &GradingConfig) -> bool {
    annual >= cfg.supletorio_min && annual <= cfg.supletorio_max
}

pub fn load_period_states(
    conn: &Connection,
    period_id: &str,
) -> Result<(PeriodState, SupplementaryState)> {
    let row: Option<(String, String)> = conn
        .query_row(
            "SELECT estado, estado_supletorio FROM academic_periods WHERE id = ?",
            [period_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    let Some((estado, supletorio)) = row else {
        return Err(LifecycleError::not_found("period", period_id));
    };
    let period = PeriodState::parse(&estado).ok_or_else(|| {
        LifecycleError::BadParams(format!("unknown period estado: {}", estado))
    })?;
    let window = SupplementaryState::parse(&supletorio).ok_or_else(|| {
        LifecycleError::BadParams(format!("unknown estado_supletorio: {}", supletorio))
    })?;
    Ok((period, window))
}

/// `transitionSupplementary(period, target)`.
pub fn transition(
    conn: &Connection,
    period_id: &str,
    target: SupplementaryState,
    cfg: &GradingConfig,
) -> Result<TransitionOutcome> {
    let (period_state, current) = load_period_states(conn, period_id)?;
    transitions::check(current, target)?;
    if period_state != PeriodState::Activo {
        return Err(LifecycleError::precondition(vec![Violation::for_entity(
            "period_not_active",
            format!("period is {}; the supplementary window is frozen", period_state),
            period_id,
        )]));
    }

    let tx = conn.unchecked_transaction()?;
    let mut eligible_count = None;
    if current == SupplementaryState::Pendiente && target == SupplementaryState::Activado {
        eligible_count = Some(recompute_eligibility(&tx, period_id, cfg)?);
    }

    let changed = tx.execute(
        "UPDATE academic_periods SET estado_supletorio = ?
         WHERE id = ? AND estado = 'ACTIVO' AND estado_supletorio = ?",
        (target.as_str(), period_id, current.as_str()),
    )?;
    if changed == 0 {
        // Someone else moved the window after we read it.
        return Err(LifecycleError::IllegalTransition {
            machine: "supplementary",
            from: current.to_string(),
            to: target.to_string(),
        });
    }
    tx.commit()?;

    tracing::info!(period_id, from = %current, to = %target, ?eligible_count, "supplementary window moved");
    Ok(TransitionOutcome {
        period_id: period_id.to_string(),
        from: current,
        to: target,
        eligible_count,
    })
}

/// Re-derives annual averages and flags the pairs inside the supletorio window.
/// Previously entered supplementary scores are kept, including on pairs that
/// drop out of the window.
fn recompute_eligibility(conn: &Connection, period_id: &str, cfg: &GradingConfig) -> Result<usize> {
    let rows = calc::period_annual_averages(conn, period_id, ScopeMode::Open, cfg)?;
    let now = now_rfc3339();
    conn.execute(
        "UPDATE supplementary_records SET eligible = 0, updated_at = ? WHERE period_id = ?",
        (&now, period_id),
    )?;

    let mut count = 0;
    for row in rows {
        if row.pair.nature != GradingNature::Quantitative {
            continue;
        }
        let Some(annual) = row.annual_average else {
            continue;
        };
        if !in_window(annual, cfg) {
            continue;
        }
        conn.execute(
            "INSERT INTO supplementary_records(period_id, offering_id, student_id, annual_average, eligible, score, updated_at)
             VALUES(?, ?, ?, ?, 1, NULL, ?)
             ON CONFLICT(period_id, offering_id, student_id) DO UPDATE SET
               annual_average = excluded.annual_average,
               eligible = 1,
               updated_at = excluded.updated_at",
            (period_id, &row.pair.offering_id, &row.pair.student_id, annual, &now),
        )?;
        count += 1;
    }
    Ok(count)
}

pub fn list(conn: &Connection, period_id: &str, cfg: &GradingConfig) -> Result<Vec<SupplementaryRow>> {
    load_period_states(conn, period_id)?;
    let mut stmt = conn.prepare(
        "SELECT r.offering_id, o.subject_name, r.student_id, s.last_name, s.first_name,
                r.annual_average, r.score
         FROM supplementary_records r
         JOIN subject_offerings o ON o.id = r.offering_id
         JOIN students s ON s.id = r.student_id
         WHERE r.period_id = ? AND r.eligible = 1
         ORDER BY o.subject_name, s.last_name, s.first_name",
    )?;
    let rows = stmt
        .query_map([period_id], |r| {
            let last: String = r.get(3)?;
            let first: String = r.get(4)?;
            let score: Option<f64> = r.get(6)?;
            Ok(SupplementaryRow {
                offering_id: r.get(0)?,
                subject_name: r.get(1)?,
                student_id: r.get(2)?,
                student_name: format!("{}, {}", last, first),
                annual_average: r.get(5)?,
                score,
                passed: score.map(|s| s >= cfg.supletorio_pass_threshold),
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Score entry is open only while the window is ACTIVADO.
pub fn record_score(
    conn: &Connection,
    period_id: &str,
    offering_id: &str,
    student_id: &str,
    score: f64,
    cfg: &GradingConfig,
) -> Result<SupplementaryRow> {
    if !(SCORE_MIN..=SCORE_MAX).contains(&score) {
        return Err(LifecycleError::BadParams(format!(
            "score must be within {}..={}",
            SCORE_MIN, SCORE_MAX
        )));
    }

    let (period_state, window) = load_period_states(conn, period_id)?;
    let mut violations = Vec::new();
    if period_state != PeriodState::Activo {
        violations.push(Violation::for_entity(
            "period_not_active",
            format!("period is {}", period_state),
            period_id,
        ));
    }
    if window != SupplementaryState::Activado {
        violations.push(Violation::for_entity(
            "supplementary_not_open",
            format!("supplementary window is {}", window),
            period_id,
        ));
    }
    let eligible: Option<i64> = conn
        .query_row(
            "SELECT eligible FROM supplementary_records
             WHERE period_id = ? AND offering_id = ? AND student_id = ?",
            (period_id, offering_id, student_id),
            |r| r.get(0),
        )
        .optional()?;
    if eligible != Some(1) {
        violations.push(Violation::for_entity(
            "not_eligible",
            "student is not eligible for a supplementary exam in this subject",
            student_id,
        ));
    }
    if !violations.is_empty() {
        return Err(LifecycleError::precondition(violations));
    }

    conn.execute(
        "UPDATE supplementary_records SET score = ?, updated_at = ?
         WHERE period_id = ? AND offering_id = ? AND student_id = ?",
        (score, now_rfc3339(), period_id, offering_id, student_id),
    )?;

    list(conn, period_id, cfg)?
        .into_iter()
        .find(|r| r.offering_id == offering_id && r.student_id == student_id)
        .ok_or_else(|| LifecycleError::not_found("supplementary record", student_id))
}
