//! Completeness check that gates a trimester's ACTIVO -> FINALIZADO edge.
//!
//! The scan yields a flat list of [`MissingGrade`]s; [`group_by_teacher`] is a
//! separate reduction so the same list can back the close dialog, batch jobs or
//! plain IPC details.

use crate::calc::{self, PairScores, ScopeMode, ScopePair, TrimesterAverage};
use crate::config::GradingConfig;
use crate::error::Result;
use crate::model::{EvaluationType, GradingNature};
use rusqlite::Connection;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MissingGrade {
    pub teacher_id: Option<String>,
    pub teacher_name: Option<String>,
    pub offering_id: String,
    pub subject_name: String,
    pub section_name: String,
    pub student_id: String,
    pub student_name: String,
    /// Empty for letter-graded offerings, where the whole letter is missing.
    pub missing: Vec<EvaluationType>,
}

impl MissingGrade {
    pub fn describe(&self) -> String {
        if self.missing.is_empty() {
            return format!(
                "Student {} missing qualitative grade in Subject {} ({})",
                self.student_name, self.subject_name, self.section_name
            );
        }
        let parts: Vec<&str> = self.missing.iter().map(|t| t.as_str()).collect();
        format!(
            "Student {} missing {} score in Subject {} ({})",
            self.student_name,
            parts.join(", "),
            self.subject_name,
            self.section_name
        )
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TeacherIssues {
    pub teacher_id: Option<String>,
    pub teacher_name: String,
    pub incomplete_count: usize,
    pub items: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GateStats {
    /// (student, offering) pairs in scope.
    pub total: usize,
    pub complete: usize,
    pub incomplete: usize,
    pub percent_complete: f64,
    /// Distinct students considered, and how many of them have any gap.
    pub students: usize,
    pub students_incomplete: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GateReport {
    pub ok: bool,
    pub blocking_issues_by_teacher: Vec<TeacherIssues>,
    pub stats: GateStats,
    #[serde(skip)]
    pub missing: Vec<MissingGrade>,
}

const UNASSIGNED_TEACHER: &str = "(sin docente)";

pub fn group_by_teacher(missing: &[MissingGrade]) -> Vec<TeacherIssues> {
    let mut groups: BTreeMap<(String, Option<String>), TeacherIssues> = BTreeMap::new();
    for m in missing {
        let name = m
            .teacher_name
            .clone()
            .unwrap_or_else(|| UNASSIGNED_TEACHER.to_string());
        let group = groups
            .entry((name.clone(), m.teacher_id.clone()))
            .or_insert_with(|| TeacherIssues {
                teacher_id: m.teacher_id.clone(),
                teacher_name: name,
                incomplete_count: 0,
                items: Vec::new(),
            });
        group.incomplete_count += 1;
        group.items.push(m.describe());
    }
    groups.into_values().collect()
}

pub fn stats(scope: &[ScopePair], missing: &[MissingGrade]) -> GateStats {
    let total = scope.len();
    let incomplete = missing.len();
    let complete = total.saturating_sub(incomplete);
    let percent_complete = if total == 0 {
        100.0
    } else {
        calc::round_off_2_decimals(100.0 * complete as f64 / total as f64)
    };
    let students: BTreeSet<&str> = scope.iter().map(|p| p.student_id.as_str()).collect();
    let students_incomplete: BTreeSet<&str> = missing.iter().map(|m| m.student_id.as_str()).collect();
    GateStats {
        total,
        complete,
        incomplete,
        percent_complete,
        students: students.len(),
        students_incomplete: students_incomplete.len(),
    }
}

/// One pass over the scope; the caller decides what to do with the averages.
pub fn evaluate_scope<F>(scope: &[ScopePair], mut average_of: F) -> Result<Vec<MissingGrade>>
where
    F: FnMut(&ScopePair) -> Result<TrimesterAverage>,
{
    let mut missing = Vec::new();
    for pair in scope {
        let avg = average_of(pair)?;
        if calc::is_complete(pair.nature, &avg) {
            continue;
        }
        let components = match pair.nature {
            GradingNature::Quantitative => avg.missing_components(),
            GradingNature::Qualitative => Vec::new(),
        };
        missing.push(MissingGrade {
            teacher_id: pair.teacher_id.clone(),
            teacher_name: pair.teacher_name.clone(),
            offering_id: pair.offering_id.clone(),
            subject_name: pair.subject_name.clone(),
            section_name: pair.section_name.clone(),
            student_id: pair.student_id.clone(),
            student_name: pair.student_name.clone(),
            missing: components,
        });
    }
    Ok(missing)
}

/// Point-in-time snapshot; re-run right before any finalize decision.
pub fn check_trimester_closable(
    conn: &Connection,
    period_id: &str,
    trimester_id: &str,
    cfg: &GradingConfig,
) -> Result<GateReport> {
    let weights = calc::load_weights(conn, period_id)?;
    weights.validate()?;
    let scope = calc::load_scope(conn, period_id, ScopeMode::Open)?;
    let scores = calc::load_trimester_scores(conn, trimester_id)?;
    let empty = PairScores::default();

    let missing = evaluate_scope(&scope, |pair| {
        let key = (pair.offering_id.clone(), pair.student_id.clone());
        calc::pair_average(
            pair.nature,
            scores.get(&key).unwrap_or(&empty),
            &weights,
            cfg,
        )
    })?;

    let stats = stats(&scope, &missing);
    tracing::debug!(
        trimester_id,
        total = stats.total,
        incomplete = stats.incomplete,
        students = stats.students,
        "trimester gate evaluated"
    );
    Ok(GateReport {
        ok: missing.is_empty(),
        blocking_issues_by_teacher: group_by_teacher(&missing),
        stats,
        missing,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calc::Weights;

    fn pair(teacher: Option<(&str, &str)>, subject: &str, student: &str) -> ScopePair {
        ScopePair {
            offering_id: format!("o-{}", subject),
            subject_name: subject.to_string(),
            nature: GradingNature::Quantitative,
            section_id: "cs1".into(),
            section_name: "3ro BGU A".into(),
            is_final_year: false,
            teacher_id: teacher.map(|t| t.0.to_string()),
            teacher_name: teacher.map(|t| t.1.to_string()),
            student_id: format!("s-{}", student),
            student_name: student.to_string(),
        }
    }

    #[test]
    fn issues_group_per_teacher_and_enumerate_everything() {
        let scope = vec![
            pair(Some(("t1", "Mora")), "Fisica", "Ana"),
            pair(Some(("t1", "Mora")), "Quimica", "Ana"),
            pair(Some(("t2", "Vera")), "Lengua", "Ana"),
            pair(None, "Arte", "Luis"),
        ];
        let w = Weights {
            insumos: 30.0,
            proyecto: 30.0,
            examen: 40.0,
        };
        let cfg = GradingConfig::default();
        let missing = evaluate_scope(&scope, |p| {
            let s = if p.subject_name == "Lengua" {
                PairScores {
                    insumos: vec![8.0],
                    proyecto: vec![8.0],
                    examen: vec![8.0],
                    qualitative: None,
                }
            } else {
                PairScores {
                    insumos: vec![8.0],
                    ..PairScores::default()
                }
            };
            calc::pair_average(p.nature, &s, &w, &cfg)
        })
        .expect("scan");

        assert_eq!(missing.len(), 3);
        let groups = group_by_teacher(&missing);
        assert_eq!(groups.len(), 2);
        let mora = groups
            .iter()
            .find(|g| g.teacher_id.as_deref() == Some("t1"))
            .expect("t1 group");
        assert_eq!(mora.incomplete_count, 2);
        assert!(mora.items[0].contains("missing PROYECTO, EXAMEN score"));
        let unassigned = groups
            .iter()
            .find(|g| g.teacher_id.is_none())
            .expect("unassigned group");
        assert_eq!(unassigned.teacher_name, UNASSIGNED_TEACHER);
    }

    fn gap(p: &ScopePair) -> MissingGrade {
        MissingGrade {
            teacher_id: p.teacher_id.clone(),
            teacher_name: p.teacher_name.clone(),
            offering_id: p.offering_id.clone(),
            subject_name: p.subject_name.clone(),
            section_name: p.section_name.clone(),
            student_id: p.student_id.clone(),
            student_name: p.student_name.clone(),
            missing: vec![EvaluationType::Examen],
        }
    }

    #[test]
    fn stats_count_pairs_and_distinct_students() {
        let scope = vec![
            pair(None, "Fisica", "Ana"),
            pair(None, "Quimica", "Ana"),
            pair(None, "Lengua", "Ana"),
            pair(None, "Fisica", "Luis"),
            pair(None, "Quimica", "Luis"),
            pair(None, "Lengua", "Luis"),
        ];
        let missing = vec![gap(&scope[0]), gap(&scope[1])];
        let s = stats(&scope, &missing);
        assert_eq!(s.total, 6);
        assert_eq!(s.complete, 4);
        assert_eq!(s.percent_complete, 66.67);
        assert_eq!(s.students, 2);
        assert_eq!(s.students_incomplete, 1);
        assert_eq!(stats(&[], &[]).percent_complete, 100.0);
        assert_eq!(stats(&scope[..4], &missing[..1]).percent_complete, 75.0);
    }
}
