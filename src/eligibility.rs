use crate::calc::{self, AnnualRow, ScopeMode};
use crate::config::GradingConfig;
use crate::error::{LifecycleError, Result};
use crate::model::{GradingNature, PeriodState};
use crate::supplementary::in_window;
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubjectStanding {
    Passed,
    PassedBySupplementary,
    /// Annual average inside the supletorio window, no passing supplementary score yet.
    Supplementary,
    Failed,
    /// No annual average; counts against the student.
    Missing,
}

impl SubjectStanding {
    pub fn is_pass(self) -> bool {
        matches!(self, Self::Passed | Self::PassedBySupplementary)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectResult {
    pub offering_id: String,
    pub subject_name: String,
    pub annual_average: Option<f64>,
    pub supplementary_score: Option<f64>,
    pub standing: SubjectStanding,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EligibilityResult {
    pub student_id: String,
    pub final_year: bool,
    pub graduated: bool,
    pub per_subject_averages: Vec<SubjectResult>,
}

pub fn subject_standing(
    annual: Option<f64>,
    supplementary_score: Option<f64>,
    cfg: &GradingConfig,
) -> SubjectStanding {
    let Some(avg) = annual else {
        return SubjectStanding::Missing;
    };
    if avg >= cfg.graduation_min {
        return SubjectStanding::Passed;
    }
    if !in_window(avg, cfg) {
        return SubjectStanding::Failed;
    }
    // A score only counts against an average that is still inside the window.
    if supplementary_score.is_some_and(|s| s >= cfg.supletorio_pass_threshold) {
        SubjectStanding::PassedBySupplementary
    } else {
        SubjectStanding::Supplementary
    }
}

/// Graduation fails closed: a final-year student needs at least one required
/// subject and a passing standing in every one of them.
pub fn evaluate(
    student_id: &str,
    final_year: bool,
    subjects: Vec<SubjectResult>,
) -> EligibilityResult {
    let graduated = final_year && !subjects.is_empty() && subjects.iter().all(|s| s.standing.is_pass());
    EligibilityResult {
        student_id: student_id.to_string(),
        final_year,
        graduated,
        per_subject_averages: subjects,
    }
}

/// Scores on pairs still flagged eligible, keyed by (offering_id, student_id).
pub fn load_supplementary_scores(
    conn: &Connection,
    period_id: &str,
) -> Result<HashMap<(String, String), f64>> {
    let mut stmt = conn.prepare(
        "SELECT offering_id, student_id, score
         FROM supplementary_records
         WHERE period_id = ? AND eligible = 1 AND score IS NOT NULL",
    )?;
    let rows = stmt
        .query_map([period_id], |r| {
            Ok((
                (r.get::<_, String>(0)?, r.get::<_, String>(1)?),
                r.get::<_, f64>(2)?,
            ))
        })?
        .collect::<std::result::Result<HashMap<_, _>, _>>()?;
    Ok(rows)
}

/// Classifies every student in the annual rows. Only quantitative offerings are required.
pub fn evaluate_all(
    rows: &[AnnualRow],
    supplementary: &HashMap<(String, String), f64>,
    cfg: &GradingConfig,
) -> Vec<EligibilityResult> {
    let mut by_student: Vec<(String, bool, Vec<SubjectResult>)> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    for row in rows {
        let slot = *index.entry(row.pair.student_id.clone()).or_insert_with(|| {
            by_student.push((row.pair.student_id.clone(), row.pair.is_final_year, Vec::new()));
            by_student.len() - 1
        });
        if row.pair.nature != GradingNature::Quantitative {
            continue;
        }
        let key = (row.pair.offering_id.clone(), row.pair.student_id.clone());
        let supplementary_score = supplementary.get(&key).copied();
        by_student[slot].2.push(SubjectResult {
            offering_id: row.pair.offering_id.clone(),
            subject_name: row.pair.subject_name.clone(),
            annual_average: row.annual_average,
            supplementary_score,
            standing: subject_standing(row.annual_average, supplementary_score, cfg),
        });
    }
    by_student
        .into_iter()
        .map(|(id, final_year, subjects)| evaluate(&id, final_year, subjects))
        .collect()
}

/// `evaluateEligibility(student, period)`.
pub fn evaluate_student(
    conn: &Connection,
    student_id: &str,
    period_id: &str,
    cfg: &GradingConfig,
) -> Result<EligibilityResult> {
    let enrolled: Option<(i64, String)> = conn
        .query_row(
            "SELECT cs.is_final_year, p.estado
             FROM enrollments e
             JOIN course_sections cs ON cs.id = e.section_id
             JOIN academic_periods p ON p.id = e.period_id
             WHERE e.student_id = ? AND e.period_id = ?",
            (student_id, period_id),
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    let Some((final_year, period_estado)) = enrolled else {
        return Err(LifecycleError::not_found("enrollment", student_id));
    };
    let mode = match PeriodState::parse(&period_estado) {
        Some(PeriodState::Finalizado) => ScopeMode::Closed,
        _ => ScopeMode::Open,
    };

    let rows: Vec<AnnualRow> = calc::period_annual_averages(conn, period_id, mode, cfg)?
        .into_iter()
        .filter(|r| r.pair.student_id == student_id)
        .collect();
    let supplementary = load_supplementary_scores(conn, period_id)?;
    let mut results = evaluate_all(&rows, &supplementary, cfg);
    Ok(results
        .pop()
        .unwrap_or_else(|| evaluate(student_id, final_year != 0, Vec::new())))
}
