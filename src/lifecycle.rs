//! Period and trimester state machines, and the period close cascade.

use crate::calc::{self, ScopeMode, Weights};
use crate::config::{GradingConfig, PendingEnrollmentPolicy};
use crate::db::now_rfc3339;
use crate::eligibility::{self, EligibilityResult};
use crate::error::{LifecycleError, Result, Violation};
use crate::gate;
use crate::model::{
    EnrollmentState, PeriodState, SectionState, StudentState, SupplementaryState, TrimesterState,
};
use crate::snapshot;
use crate::supplementary::load_period_states;
use crate::transitions;
use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::path::Path;
use uuid::Uuid;

pub const TRIMESTERS_PER_PERIOD: i64 = 3;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrimesterInfo {
    pub id: String,
    pub period_id: String,
    pub ordinal: i64,
    pub estado: TrimesterState,
    pub finalized_at: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeriodInfo {
    pub id: String,
    pub name: String,
    pub start_date: String,
    pub end_date: String,
    pub estado: PeriodState,
    pub estado_supletorio: SupplementaryState,
    pub finalized_at: Option<String>,
    pub weights: Option<Weights>,
    pub trimesters: Vec<TrimesterInfo>,
}

fn parse_date(raw: &str, key: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|_| LifecycleError::BadParams(format!("{} must be YYYY-MM-DD", key)))
}

fn active_period_id(conn: &Connection) -> Result<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT id FROM academic_periods WHERE estado = 'ACTIVO'",
            [],
            |r| r.get(0),
        )
        .optional()?)
}

pub fn load_trimesters(conn: &Connection, period_id: &str) -> Result<Vec<TrimesterInfo>> {
    let mut stmt = conn.prepare(
        "SELECT id, period_id, ordinal, estado, finalized_at
         FROM trimesters WHERE period_id = ? ORDER BY ordinal",
    )?;
    let rows = stmt
        .query_map([period_id], |r| {
            let estado: String = r.get(3)?;
            Ok(TrimesterInfo {
                id: r.get(0)?,
                period_id: r.get(1)?,
                ordinal: r.get(2)?,
                estado: TrimesterState::parse(&estado).unwrap_or(TrimesterState::Pendiente),
                finalized_at: r.get(4)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn load_trimester(conn: &Connection, trimester_id: &str) -> Result<TrimesterInfo> {
    let row: Option<(String, i64, String, Option<String>)> = conn
        .query_row(
            "SELECT period_id, ordinal, estado, finalized_at FROM trimesters WHERE id = ?",
            [trimester_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .optional()?;
    let Some((period_id, ordinal, estado, finalized_at)) = row else {
        return Err(LifecycleError::not_found("trimester", trimester_id));
    };
    Ok(TrimesterInfo {
        id: trimester_id.to_string(),
        period_id,
        ordinal,
        estado: TrimesterState::parse(&estado).ok_or_else(|| {
            LifecycleError::BadParams(format!("unknown trimester estado: {}", estado))
        })?,
        finalized_at,
    })
}

pub fn get_period(conn: &Connection, period_id: &str) -> Result<PeriodInfo> {
    let row: Option<(String, String, String, Option<String>)> = conn
        .query_row(
            "SELECT name, start_date, end_date, finalized_at FROM academic_periods WHERE id = ?",
            [period_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .optional()?;
    let Some((name, start_date, end_date, finalized_at)) = row else {
        return Err(LifecycleError::not_found("period", period_id));
    };
    let (estado, estado_supletorio) = load_period_states(conn, period_id)?;
    let weights = match calc::load_weights(conn, period_id) {
        Ok(w) => Some(w),
        Err(LifecycleError::Configuration { .. }) => None,
        Err(e) => return Err(e),
    };
    Ok(PeriodInfo {
        id: period_id.to_string(),
        name,
        start_date,
        end_date,
        estado,
        estado_supletorio,
        finalized_at,
        weights,
        trimesters: load_trimesters(conn, period_id)?,
    })
}

pub fn list_periods(conn: &Connection) -> Result<Vec<PeriodInfo>> {
    let mut stmt = conn.prepare("SELECT id FROM academic_periods ORDER BY start_date DESC")?;
    let ids = stmt
        .query_map([], |r| r.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    ids.iter().map(|id| get_period(conn, id)).collect()
}

/// New periods start ACTIVO with supletorio PENDIENTE and three PENDIENTE trimesters.
pub fn create_period(
    conn: &Connection,
    name: &str,
    start_date: &str,
    end_date: &str,
    weights: Option<Weights>,
) -> Result<PeriodInfo> {
    let name = name.trim();
    if name.is_empty() {
        return Err(LifecycleError::BadParams("name must not be empty".into()));
    }
    let start = parse_date(start_date, "startDate")?;
    let end = parse_date(end_date, "endDate")?;
    if start >= end {
        return Err(LifecycleError::BadParams(
            "startDate must be before endDate".into(),
        ));
    }
    if let Some(w) = &weights {
        w.validate()?;
    }
    if let Some(active_id) = active_period_id(conn)? {
        return Err(LifecycleError::precondition(vec![Violation::for_entity(
            "active_period_exists",
            "the current period must be FINALIZADO before a new one is created",
            &active_id,
        )]));
    }

    let period_id = Uuid::new_v4().to_string();
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "INSERT INTO academic_periods(id, name, start_date, end_date, estado, estado_supletorio, created_at)
         VALUES(?, ?, ?, ?, 'ACTIVO', 'PENDIENTE', ?)",
        (
            &period_id,
            name,
            start.format("%Y-%m-%d").to_string(),
            end.format("%Y-%m-%d").to_string(),
            now_rfc3339(),
        ),
    )?;
    for ordinal in 1..=TRIMESTERS_PER_PERIOD {
        tx.execute(
            "INSERT INTO trimesters(id, period_id, ordinal, estado) VALUES(?, ?, ?, 'PENDIENTE')",
            (Uuid::new_v4().to_string(), &period_id, ordinal),
        )?;
    }
    if let Some(w) = weights {
        upsert_weights(&tx, &period_id, &w)?;
    }
    tx.commit()?;

    tracing::info!(period_id = %period_id, name, "period created");
    get_period(conn, &period_id)
}

fn upsert_weights(conn: &Connection, period_id: &str, w: &Weights) -> Result<()> {
    conn.execute(
        "INSERT INTO evaluation_weights(period_id, insumos, proyecto, examen)
         VALUES(?, ?, ?, ?)
         ON CONFLICT(period_id) DO UPDATE SET
           insumos = excluded.insumos,
           proyecto = excluded.proyecto,
           examen = excluded.examen",
        (period_id, w.insumos, w.proyecto, w.examen),
    )?;
    Ok(())
}

/// Any in-range triple is stored; only aggregation insists on the 100 total.
/// Weights lock once a trimester has been finalized with them.
pub fn set_weights(conn: &Connection, period_id: &str, w: Weights) -> Result<Weights> {
    for (key, v) in [
        ("insumos", w.insumos),
        ("proyecto", w.proyecto),
        ("examen", w.examen),
    ] {
        if !(0.0..=100.0).contains(&v) {
            return Err(LifecycleError::BadParams(format!(
                "{} must be within 0..=100",
                key
            )));
        }
    }
    let (period_state, _) = load_period_states(conn, period_id)?;
    let mut violations = Vec::new();
    if period_state != PeriodState::Activo {
        violations.push(Violation::for_entity(
            "period_not_active",
            format!("period is {}", period_state),
            period_id,
        ));
    }
    for t in load_trimesters(conn, period_id)? {
        if t.estado == TrimesterState::Finalizado {
            violations.push(Violation::for_entity(
                "trimester_finalized",
                format!("trimester {} is already FINALIZADO", t.ordinal),
                &t.id,
            ));
        }
    }
    if !violations.is_empty() {
        return Err(LifecycleError::precondition(violations));
    }
    upsert_weights(conn, period_id, &w)?;
    Ok(w)
}

fn require_period_active(conn: &Connection, period_id: &str) -> Result<()> {
    let (period_state, _) = load_period_states(conn, period_id)?;
    if period_state != PeriodState::Activo {
        return Err(LifecycleError::precondition(vec![Violation::for_entity(
            "period_not_active",
            format!("period is {}", period_state),
            period_id,
        )]));
    }
    Ok(())
}

/// PENDIENTE -> ACTIVO. Trimesters open in ordinal order.
pub fn activate_trimester(conn: &Connection, trimester_id: &str) -> Result<TrimesterInfo> {
    let t = load_trimester(conn, trimester_id)?;
    transitions::check(t.estado, TrimesterState::Activo)?;
    require_period_active(conn, &t.period_id)?;

    let previous_open: Vec<TrimesterInfo> = load_trimesters(conn, &t.period_id)?
        .into_iter()
        .filter(|o| o.ordinal < t.ordinal && o.estado != TrimesterState::Finalizado)
        .collect();
    if !previous_open.is_empty() {
        return Err(LifecycleError::precondition(
            previous_open
                .iter()
                .map(|o| {
                    Violation::for_entity(
                        "previous_trimester_open",
                        format!("trimester {} is {}", o.ordinal, o.estado),
                        &o.id,
                    )
                })
                .collect(),
        ));
    }

    let changed = conn.execute(
        "UPDATE trimesters SET estado = 'ACTIVO' WHERE id = ? AND estado = 'PENDIENTE'",
        [trimester_id],
    )?;
    if changed == 0 {
        return Err(LifecycleError::IllegalTransition {
            machine: "trimester",
            from: t.estado.to_string(),
            to: TrimesterState::Activo.to_string(),
        });
    }
    tracing::info!(trimester_id, ordinal = t.ordinal, "trimester activated");
    load_trimester(conn, trimester_id)
}

/// Replaces every stored average of the trimester with one re-derived from scores.
fn write_trimester_averages(
    conn: &Connection,
    period_id: &str,
    trimester_id: &str,
    cfg: &GradingConfig,
) -> Result<usize> {
    let weights = calc::load_weights(conn, period_id)?;
    let scope = calc::load_scope(conn, period_id, ScopeMode::Open)?;
    let scores = calc::load_trimester_scores(conn, trimester_id)?;
    let empty = calc::PairScores::default();
    let now = now_rfc3339();

    conn.execute(
        "DELETE FROM trimester_averages WHERE trimester_id = ?",
        [trimester_id],
    )?;
    let mut stmt = conn.prepare(
        "INSERT INTO trimester_averages(
            offering_id, student_id, trimester_id,
            promedio_insumos, ponderado_insumos, nota_proyecto, ponderado_proyecto,
            nota_examen, ponderado_examen, nota_final_trimestre, cualitativa, computed_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )?;
    for pair in &scope {
        let key = (pair.offering_id.clone(), pair.student_id.clone());
        let avg = calc::pair_average(
            pair.nature,
            scores.get(&key).unwrap_or(&empty),
            &weights,
            cfg,
        )?;
        stmt.execute(rusqlite::params![
            pair.offering_id,
            pair.student_id,
            trimester_id,
            avg.promedio_insumos,
            avg.ponderado_insumos,
            avg.nota_proyecto,
            avg.ponderado_proyecto,
            avg.nota_examen,
            avg.ponderado_examen,
            avg.nota_final_trimestre,
            avg.cualitativa.map(|b| b.as_str()),
            now,
        ])?;
    }
    Ok(scope.len())
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrimesterFinalizeOutcome {
    pub trimester: TrimesterInfo,
    pub averages_written: usize,
}

/// ACTIVO -> FINALIZADO. The gate is re-run inside the same transaction that
/// flips the state, so no earlier check result is trusted.
pub fn finalize_trimester(
    conn: &Connection,
    trimester_id: &str,
    cfg: &GradingConfig,
) -> Result<TrimesterFinalizeOutcome> {
    let t = load_trimester(conn, trimester_id)?;
    transitions::check(t.estado, TrimesterState::Finalizado)?;
    require_period_active(conn, &t.period_id)?;

    let tx = conn.unchecked_transaction()?;
    let report = gate::check_trimester_closable(&tx, &t.period_id, trimester_id, cfg)?;
    if !report.ok {
        tracing::warn!(
            trimester_id,
            incomplete = report.stats.incomplete,
            "trimester close refused"
        );
        return Err(LifecycleError::IncompleteData {
            message: format!(
                "{} of {} student/subject pairs are incomplete",
                report.stats.incomplete, report.stats.total
            ),
            details: json!({
                "blockingIssuesByTeacher": report.blocking_issues_by_teacher,
                "stats": report.stats,
                "missing": report.missing,
            }),
        });
    }

    let written = write_trimester_averages(&tx, &t.period_id, trimester_id, cfg)?;
    let changed = tx.execute(
        "UPDATE trimesters SET estado = 'FINALIZADO', finalized_at = ?
         WHERE id = ? AND estado = 'ACTIVO'",
        (now_rfc3339(), trimester_id),
    )?;
    if changed == 0 {
        return Err(LifecycleError::IllegalTransition {
            machine: "trimester",
            from: t.estado.to_string(),
            to: TrimesterState::Finalizado.to_string(),
        });
    }
    tx.commit()?;

    tracing::info!(trimester_id, ordinal = t.ordinal, written, "trimester finalized");
    Ok(TrimesterFinalizeOutcome {
        trimester: load_trimester(conn, trimester_id)?,
        averages_written: written,
    })
}

/// Re-runs aggregation for an already FINALIZADO trimester of an open period.
pub fn recompute_trimester(
    conn: &Connection,
    trimester_id: &str,
    cfg: &GradingConfig,
) -> Result<usize> {
    let t = load_trimester(conn, trimester_id)?;
    if t.estado != TrimesterState::Finalizado {
        return Err(LifecycleError::precondition(vec![Violation::for_entity(
            "trimester_not_finalized",
            format!("trimester {} is {}", t.ordinal, t.estado),
            trimester_id,
        )]));
    }
    require_period_active(conn, &t.period_id)?;
    let tx = conn.unchecked_transaction()?;
    let written = write_trimester_averages(&tx, &t.period_id, trimester_id, cfg)?;
    tx.commit()?;
    Ok(written)
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeCounts {
    pub enrollments_finalized: usize,
    pub graduated: usize,
    pub sin_matricula: usize,
    pub kept_active: usize,
    pub sections_deactivated: usize,
    pub offerings_deactivated: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeriodFinalizeOutcome {
    pub period_id: String,
    pub counts: FinalizeCounts,
    pub graduated_student_ids: Vec<String>,
    pub warnings: Vec<Violation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<snapshot::SnapshotSummary>,
}

/// Every reason the period cannot close, found in one pass.
pub fn finalize_blockers(conn: &Connection, period_id: &str) -> Result<Vec<Violation>> {
    let (_, window) = load_period_states(conn, period_id)?;
    let mut violations: Vec<Violation> = load_trimesters(conn, period_id)?
        .into_iter()
        .filter(|t| t.estado != TrimesterState::Finalizado)
        .map(|t| {
            Violation::for_entity(
                "trimester_not_finalized",
                format!("trimester {} is {}", t.ordinal, t.estado),
                &t.id,
            )
        })
        .collect();
    if window == SupplementaryState::Activado {
        violations.push(Violation::for_entity(
            "supplementary_open",
            "the supplementary window is ACTIVADO; close it before finalizing",
            period_id,
        ));
    }
    Ok(violations)
}

fn student_target_state(
    graduated: bool,
    has_forward_enrollment: bool,
    policy: PendingEnrollmentPolicy,
) -> StudentState {
    if graduated {
        return StudentState::Graduado;
    }
    if has_forward_enrollment {
        return StudentState::Activo;
    }
    match policy {
        PendingEnrollmentPolicy::SinMatricula => StudentState::SinMatricula,
        PendingEnrollmentPolicy::KeepActive => StudentState::Activo,
    }
}

/// `finalizePeriod(period)`: ACTIVO -> FINALIZADO with the full cascade, all or nothing.
pub fn finalize_period(
    conn: &Connection,
    period_id: &str,
    cfg: &GradingConfig,
    snapshot_target: Option<(&Path, &Path)>,
) -> Result<PeriodFinalizeOutcome> {
    let (period_state, window) = load_period_states(conn, period_id)?;
    transitions::check(period_state, PeriodState::Finalizado)?;

    let blockers = finalize_blockers(conn, period_id)?;
    if !blockers.is_empty() {
        tracing::warn!(period_id, blockers = blockers.len(), "period close refused");
        return Err(LifecycleError::precondition(blockers));
    }
    let mut warnings = Vec::new();
    if window == SupplementaryState::Pendiente {
        warnings.push(Violation::for_entity(
            "supplementary_never_opened",
            "the supplementary window was never opened for this period",
            period_id,
        ));
    }

    let snapshot = match snapshot_target {
        Some((db_path, out_path)) => Some(snapshot::write_snapshot(db_path, out_path, period_id)?),
        None => None,
    };

    let tx = conn.unchecked_transaction()?;
    let now = now_rfc3339();

    // Claim the period first; a concurrent finalize loses here and rolls back.
    let claimed = tx.execute(
        "UPDATE academic_periods SET estado = 'FINALIZADO', finalized_at = ?
         WHERE id = ? AND estado = 'ACTIVO'",
        (&now, period_id),
    )?;
    if claimed == 0 {
        return Err(LifecycleError::IllegalTransition {
            machine: "period",
            from: PeriodState::Finalizado.to_string(),
            to: PeriodState::Finalizado.to_string(),
        });
    }

    let annual = calc::period_annual_averages(&tx, period_id, ScopeMode::Open, cfg)?;
    let supplementary = eligibility::load_supplementary_scores(&tx, period_id)?;
    let results: HashMap<String, EligibilityResult> =
        eligibility::evaluate_all(&annual, &supplementary, cfg)
            .into_iter()
            .map(|r| (r.student_id.clone(), r))
            .collect();

    let mut stmt = tx.prepare(
        "SELECT e.student_id,
                EXISTS(SELECT 1 FROM enrollments f
                       WHERE f.student_id = e.student_id AND f.period_id <> e.period_id
                         AND f.estado = 'ACTIVO')
         FROM enrollments e
         WHERE e.period_id = ? AND e.estado = 'ACTIVO'",
    )?;
    let enrolled: Vec<(String, bool)> = stmt
        .query_map([period_id], |r| Ok((r.get(0)?, r.get::<_, i64>(1)? != 0)))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    drop(stmt);

    let mut counts = FinalizeCounts::default();
    counts.enrollments_finalized = tx.execute(
        "UPDATE enrollments SET estado = ?, updated_at = ? WHERE period_id = ? AND estado = 'ACTIVO'",
        (EnrollmentState::Finalizado.as_str(), &now, period_id),
    )?;

    let mut graduated_student_ids = Vec::new();
    for (student_id, has_forward) in &enrolled {
        let graduated = results.get(student_id).is_some_and(|r| r.graduated);
        let target = student_target_state(graduated, *has_forward, cfg.pending_enrollment_policy);
        match target {
            StudentState::Graduado => {
                counts.graduated += 1;
                graduated_student_ids.push(student_id.clone());
            }
            StudentState::SinMatricula => counts.sin_matricula += 1,
            _ => counts.kept_active += 1,
        }
        tx.execute(
            "UPDATE students SET
               estado = ?,
               current_section_id = CASE
                 WHEN current_section_id IN (SELECT id FROM course_sections WHERE period_id = ?)
                 THEN NULL ELSE current_section_id END,
               updated_at = ?
             WHERE id = ?",
            (target.as_str(), period_id, &now, student_id),
        )?;
    }

    let inactivo = SectionState::Inactivo.as_str();
    counts.sections_deactivated = tx.execute(
        "UPDATE course_sections SET estado = ?1 WHERE period_id = ?2 AND estado <> ?1",
        (inactivo, period_id),
    )?;
    counts.offerings_deactivated = tx.execute(
        "UPDATE subject_offerings SET estado = ?1 WHERE period_id = ?2 AND estado <> ?1",
        (inactivo, period_id),
    )?;

    tx.commit()?;
    tracing::info!(
        period_id,
        enrollments = counts.enrollments_finalized,
        graduated = counts.graduated,
        sin_matricula = counts.sin_matricula,
        "period finalized"
    );

    Ok(PeriodFinalizeOutcome {
        period_id: period_id.to_string(),
        counts,
        graduated_student_ids,
        warnings,
        snapshot,
    })
}

/// ACTIVO -> RETIRADO with a reason; the student leaves the course too.
pub fn withdraw_enrollment(conn: &Connection, enrollment_id: &str, reason: &str) -> Result<()> {
    let reason = reason.trim();
    if reason.is_empty() {
        return Err(LifecycleError::BadParams("reason must not be empty".into()));
    }
    let row: Option<(String, String)> = conn
        .query_row(
            "SELECT student_id, estado FROM enrollments WHERE id = ?",
            [enrollment_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    let Some((student_id, estado)) = row else {
        return Err(LifecycleError::not_found("enrollment", enrollment_id));
    };
    let from = EnrollmentState::parse(&estado).ok_or_else(|| {
        LifecycleError::BadParams(format!("unknown enrollment estado: {}", estado))
    })?;
    transitions::check(from, EnrollmentState::Retirado)?;

    let now = now_rfc3339();
    let tx = conn.unchecked_transaction()?;
    let changed = tx.execute(
        "UPDATE enrollments SET estado = 'RETIRADO', withdraw_reason = ?, updated_at = ?
         WHERE id = ? AND estado = 'ACTIVO'",
        (reason, &now, enrollment_id),
    )?;
    if changed == 0 {
        return Err(LifecycleError::IllegalTransition {
            machine: "enrollment",
            from: from.to_string(),
            to: EnrollmentState::Retirado.to_string(),
        });
    }
    tx.execute(
        "UPDATE students SET estado = ?, current_section_id = NULL, updated_at = ? WHERE id = ?",
        (StudentState::Retirado.as_str(), &now, &student_id),
    )?;
    tx.commit()?;
    tracing::info!(enrollment_id, student_id = %student_id, "enrollment withdrawn");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn graduation_wins_over_enrollment_policy() {
        assert_eq!(
            student_target_state(true, false, PendingEnrollmentPolicy::SinMatricula),
            StudentState::Graduado
        );
        assert_eq!(
            student_target_state(true, true, PendingEnrollmentPolicy::KeepActive),
            StudentState::Graduado
        );
    }

    #[test]
    fn pending_students_follow_the_configured_policy() {
        assert_eq!(
            student_target_state(false, false, PendingEnrollmentPolicy::SinMatricula),
            StudentState::SinMatricula
        );
        assert_eq!(
            student_target_state(false, false, PendingEnrollmentPolicy::KeepActive),
            StudentState::Activo
        );
        assert_eq!(
            student_target_state(false, true, PendingEnrollmentPolicy::SinMatricula),
            StudentState::Activo
        );
    }

    #[test]
    fn dates_must_be_iso() {
        assert!(parse_date("2025-09-01", "startDate").is_ok());
        assert!(parse_date("01/09/2025", "startDate").is_err());
    }
}
