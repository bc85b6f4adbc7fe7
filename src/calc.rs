use crate::config::{GradingConfig, GRADE_DECIMALS};
use crate::error::{LifecycleError, Result};
use crate::model::{Band, EvaluationType, GradingNature};
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;

const WEIGHT_TOTAL: f64 = 100.0;
const WEIGHT_EPSILON: f64 = 1e-9;

/// Half-up rounding to [`GRADE_DECIMALS`] places: `Int(100*x + 0.5) / 100`.
pub fn round_off_2_decimals(x: f64) -> f64 {
    let scale = 10_f64.powi(GRADE_DECIMALS);
    ((scale * x) + 0.5).floor() / scale
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Weights {
    pub insumos: f64,
    pub proyecto: f64,
    pub examen: f64,
}

impl Weights {
    pub fn get(&self, t: EvaluationType) -> f64 {
        match t {
            EvaluationType::Insumos => self.insumos,
            EvaluationType::Proyecto => self.proyecto,
            EvaluationType::Examen => self.examen,
        }
    }

    pub fn total(&self) -> f64 {
        self.insumos + self.proyecto + self.examen
    }

    /// Never normalizes: a triple that does not add up to 100 blocks aggregation.
    pub fn validate(&self) -> Result<()> {
        let out_of_range: Vec<&str> = EvaluationType::ALL
            .iter()
            .filter(|t| !(0.0..=WEIGHT_TOTAL).contains(&self.get(**t)))
            .map(|t| t.as_str())
            .collect();
        if !out_of_range.is_empty() || (self.total() - WEIGHT_TOTAL).abs() > WEIGHT_EPSILON {
            return Err(LifecycleError::Configuration {
                message: format!(
                    "evaluation weights must each be within 0..=100 and sum to 100 (got {})",
                    self.total()
                ),
                details: json!({
                    "weights": self,
                    "total": self.total(),
                    "outOfRange": out_of_range,
                }),
            });
        }
        Ok(())
    }
}

/// Raw scores for one (student, offering, trimester).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PairScores {
    pub insumos: Vec<f64>,
    pub proyecto: Vec<f64>,
    pub examen: Vec<f64>,
    pub qualitative: Option<Band>,
}

impl PairScores {
    pub fn component(&self, t: EvaluationType) -> &[f64] {
        match t {
            EvaluationType::Insumos => &self.insumos,
            EvaluationType::Proyecto => &self.proyecto,
            EvaluationType::Examen => &self.examen,
        }
    }

    fn push(&mut self, t: EvaluationType, v: f64) {
        match t {
            EvaluationType::Insumos => self.insumos.push(v),
            EvaluationType::Proyecto => self.proyecto.push(v),
            EvaluationType::Examen => self.examen.push(v),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrimesterAverage {
    pub promedio_insumos: Option<f64>,
    pub ponderado_insumos: Option<f64>,
    pub nota_proyecto: Option<f64>,
    pub ponderado_proyecto: Option<f64>,
    pub nota_examen: Option<f64>,
    pub ponderado_examen: Option<f64>,
    pub nota_final_trimestre: Option<f64>,
    pub cualitativa: Option<Band>,
}

impl TrimesterAverage {
    pub fn ponderado(&self, t: EvaluationType) -> Option<f64> {
        match t {
            EvaluationType::Insumos => self.ponderado_insumos,
            EvaluationType::Proyecto => self.ponderado_proyecto,
            EvaluationType::Examen => self.ponderado_examen,
        }
    }

    pub fn missing_components(&self) -> Vec<EvaluationType> {
        EvaluationType::ALL
            .iter()
            .copied()
            .filter(|t| self.ponderado(*t).is_none())
            .collect()
    }
}

/// `None` when there are no scores; an empty component is never zero.
pub fn component_average(scores: &[f64]) -> Option<f64> {
    if scores.is_empty() {
        return None;
    }
    let sum: f64 = scores.iter().sum();
    Some(round_off_2_decimals(sum / scores.len() as f64))
}

pub fn band_for(nota: f64, cfg: &GradingConfig) -> Band {
    if nota >= cfg.band_da_min {
        Band::Da
    } else if nota >= cfg.band_aa_min {
        Band::Aa
    } else if nota >= cfg.band_pa_min {
        Band::Pa
    } else {
        Band::Na
    }
}

pub fn quantitative_average(
    scores: &PairScores,
    weights: &Weights,
    cfg: &GradingConfig,
) -> Result<TrimesterAverage> {
    weights.validate()?;

    let promedio = |t: EvaluationType| component_average(scores.component(t));
    let ponderar = |p: Option<f64>, t: EvaluationType| {
        p.map(|v| round_off_2_decimals(v * (weights.get(t) / WEIGHT_TOTAL)))
    };

    let promedio_insumos = promedio(EvaluationType::Insumos);
    let nota_proyecto = promedio(EvaluationType::Proyecto);
    let nota_examen = promedio(EvaluationType::Examen);
    let ponderado_insumos = ponderar(promedio_insumos, EvaluationType::Insumos);
    let ponderado_proyecto = ponderar(nota_proyecto, EvaluationType::Proyecto);
    let ponderado_examen = ponderar(nota_examen, EvaluationType::Examen);

    let nota_final_trimestre = match (ponderado_insumos, ponderado_proyecto, ponderado_examen) {
        (Some(a), Some(b), Some(c)) => Some(round_off_2_decimals(a + b + c)),
        _ => None,
    };

    Ok(TrimesterAverage {
        promedio_insumos,
        ponderado_insumos,
        nota_proyecto,
        ponderado_proyecto,
        nota_examen,
        ponderado_examen,
        nota_final_trimestre,
        cualitativa: nota_final_trimestre.map(|n| band_for(n, cfg)),
    })
}

pub fn pair_average(
    nature: GradingNature,
    scores: &PairScores,
    weights: &Weights,
    cfg: &GradingConfig,
) -> Result<TrimesterAverage> {
    match nature {
        GradingNature::Quantitative => quantitative_average(scores, weights, cfg),
        GradingNature::Qualitative => Ok(TrimesterAverage {
            cualitativa: scores.qualitative,
            ..TrimesterAverage::default()
        }),
    }
}

pub fn is_complete(nature: GradingNature, avg: &TrimesterAverage) -> bool {
    match nature {
        GradingNature::Quantitative => avg.nota_final_trimestre.is_some(),
        GradingNature::Qualitative => avg.cualitativa.is_some(),
    }
}

/// Mean of the trimester finals; any missing trimester leaves the year without an average.
pub fn annual_average(finals: &[Option<f64>]) -> Option<f64> {
    if finals.is_empty() {
        return None;
    }
    let present: Option<Vec<f64>> = finals.iter().copied().collect();
    let present = present?;
    Some(round_off_2_decimals(
        present.iter().sum::<f64>() / present.len() as f64,
    ))
}

pub fn mean_ignoring_nulls<I>(values: I) -> Option<f64>
where
    I: IntoIterator<Item = Option<f64>>,
{
    let mut sum = 0.0_f64;
    let mut count = 0_usize;
    for v in values.into_iter().flatten() {
        sum += v;
        count += 1;
    }
    if count == 0 {
        None
    } else {
        Some(round_off_2_decimals(sum / count as f64))
    }
}

/// The course-level PROMEDIOS row: column-wise mean of the per-student rows.
pub fn promedios_row(rows: &[TrimesterAverage], cfg: &GradingConfig) -> TrimesterAverage {
    let col = |f: fn(&TrimesterAverage) -> Option<f64>| mean_ignoring_nulls(rows.iter().map(f));
    let nota_final_trimestre = col(|r| r.nota_final_trimestre);
    TrimesterAverage {
        promedio_insumos: col(|r| r.promedio_insumos),
        ponderado_insumos: col(|r| r.ponderado_insumos),
        nota_proyecto: col(|r| r.nota_proyecto),
        ponderado_proyecto: col(|r| r.ponderado_proyecto),
        nota_examen: col(|r| r.nota_examen),
        ponderado_examen: col(|r| r.ponderado_examen),
        nota_final_trimestre,
        cualitativa: nota_final_trimestre.map(|n| band_for(n, cfg)),
    }
}

// ---------------------------------------------------------------------------
// Loaders. Every aggregation re-derives from grade_scores; nothing is patched
// incrementally.

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopePair {
    pub offering_id: String,
    pub subject_name: String,
    pub nature: GradingNature,
    pub section_id: String,
    pub section_name: String,
    pub is_final_year: bool,
    pub teacher_id: Option<String>,
    pub teacher_name: Option<String>,
    pub student_id: String,
    pub student_name: String,
}

pub fn load_weights(conn: &Connection, period_id: &str) -> Result<Weights> {
    let row: Option<(f64, f64, f64)> = conn
        .query_row(
            "SELECT insumos, proyecto, examen FROM evaluation_weights WHERE period_id = ?",
            [period_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()?;
    let Some((insumos, proyecto, examen)) = row else {
        return Err(LifecycleError::Configuration {
            message: "evaluation weights are not configured for this period".to_string(),
            details: json!({ "periodId": period_id }),
        });
    };
    Ok(Weights {
        insumos,
        proyecto,
        examen,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeMode {
    /// ACTIVO offerings and sections, ACTIVO enrollments.
    Open,
    /// After the period closed: everything that ended FINALIZADO as well.
    Closed,
}

/// Every (offering, enrolled student) pair of a period, in teacher / subject /
/// student order.
pub fn load_scope(conn: &Connection, period_id: &str, mode: ScopeMode) -> Result<Vec<ScopePair>> {
    let filter = match mode {
        ScopeMode::Open => "AND o.estado = 'ACTIVO' AND cs.estado = 'ACTIVO' AND e.estado = 'ACTIVO'",
        ScopeMode::Closed => "AND e.estado IN ('ACTIVO', 'FINALIZADO')",
    };
    let sql = format!(
        "SELECT o.id, o.subject_name, o.nature, cs.id, cs.name, cs.is_final_year,
                t.id, t.display_name, s.id, s.last_name, s.first_name
         FROM subject_offerings o
         JOIN course_sections cs ON cs.id = o.section_id
         JOIN enrollments e ON e.section_id = cs.id AND e.period_id = o.period_id
         JOIN students s ON s.id = e.student_id
         LEFT JOIN teachers t ON t.id = o.teacher_id
         WHERE o.period_id = ? {}
         ORDER BY t.display_name, o.subject_name, cs.name, s.last_name, s.first_name",
        filter
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([period_id], |r| {
            let last: String = r.get(9)?;
            let first: String = r.get(10)?;
            Ok((
                r.get::<_, String>(2)?,
                ScopePair {
                    offering_id: r.get(0)?,
                    subject_name: r.get(1)?,
                    nature: GradingNature::Quantitative,
                    section_id: r.get(3)?,
                    section_name: r.get(4)?,
                    is_final_year: r.get::<_, i64>(5)? != 0,
                    teacher_id: r.get(6)?,
                    teacher_name: r.get(7)?,
                    student_id: r.get(8)?,
                    student_name: format!("{}, {}", last, first),
                },
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    rows.into_iter()
        .map(|(code, pair)| {
            Ok(ScopePair {
                nature: parse_nature(&code)?,
                ..pair
            })
        })
        .collect()
}

pub fn parse_nature(code: &str) -> Result<GradingNature> {
    GradingNature::parse(code)
        .ok_or_else(|| LifecycleError::BadParams(format!("unknown offering nature: {}", code)))
}

/// All scores of one trimester keyed by (offering_id, student_id).
pub fn load_trimester_scores(
    conn: &Connection,
    trimester_id: &str,
) -> Result<HashMap<(String, String), PairScores>> {
    let mut stmt = conn.prepare(
        "SELECT offering_id, student_id, evaluation_type, score, qualitative
         FROM grade_scores
         WHERE trimester_id = ?
         ORDER BY recorded_at, rowid",
    )?;
    let rows = stmt.query_map([trimester_id], |r| {
        Ok((
            r.get::<_, String>(0)?,
            r.get::<_, String>(1)?,
            r.get::<_, Option<String>>(2)?,
            r.get::<_, Option<f64>>(3)?,
            r.get::<_, Option<String>>(4)?,
        ))
    })?;

    let mut out: HashMap<(String, String), PairScores> = HashMap::new();
    for row in rows {
        let (offering_id, student_id, eval_type, score, qualitative) = row?;
        let entry = out.entry((offering_id, student_id)).or_default();
        if let Some(band) = qualitative.as_deref().and_then(Band::parse) {
            // Latest letter wins.
            entry.qualitative = Some(band);
            continue;
        }
        if let (Some(t), Some(v)) = (eval_type.as_deref().and_then(EvaluationType::parse), score) {
            entry.push(t, v);
        }
    }
    Ok(out)
}

pub fn load_pair_scores(
    conn: &Connection,
    offering_id: &str,
    student_id: &str,
    trimester_id: &str,
) -> Result<PairScores> {
    let key = (offering_id.to_string(), student_id.to_string());
    Ok(load_trimester_scores(conn, trimester_id)?
        .remove(&key)
        .unwrap_or_default())
}

/// Trimester ids of a period ordered by ordinal.
pub fn period_trimester_ids(conn: &Connection, period_id: &str) -> Result<Vec<String>> {
    let mut stmt =
        conn.prepare("SELECT id FROM trimesters WHERE period_id = ? ORDER BY ordinal")?;
    let ids = stmt
        .query_map([period_id], |r| r.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(ids)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnualRow {
    #[serde(flatten)]
    pub pair: ScopePair,
    pub trimester_finals: Vec<Option<f64>>,
    pub annual_average: Option<f64>,
    pub qualitative: Option<Band>,
}

/// Annual averages for every pair in the period, re-derived from raw scores.
pub fn period_annual_averages(
    conn: &Connection,
    period_id: &str,
    mode: ScopeMode,
    cfg: &GradingConfig,
) -> Result<Vec<AnnualRow>> {
    let weights = load_weights(conn, period_id)?;
    weights.validate()?;
    let scope = load_scope(conn, period_id, mode)?;
    let trimester_ids = period_trimester_ids(conn, period_id)?;
    let mut per_trimester = Vec::with_capacity(trimester_ids.len());
    for id in &trimester_ids {
        per_trimester.push(load_trimester_scores(conn, id)?);
    }

    let empty = PairScores::default();
    let mut out = Vec::with_capacity(scope.len());
    for pair in scope {
        let key = (pair.offering_id.clone(), pair.student_id.clone());
        let mut finals = Vec::with_capacity(per_trimester.len());
        let mut qualitative = None;
        for scores in &per_trimester {
            let s = scores.get(&key).unwrap_or(&empty);
            let avg = pair_average(pair.nature, s, &weights, cfg)?;
            finals.push(avg.nota_final_trimestre);
            if avg.cualitativa.is_some() && pair.nature == GradingNature::Qualitative {
                qualitative = avg.cualitativa;
            }
        }
        let annual = match pair.nature {
            GradingNature::Quantitative => annual_average(&finals),
            GradingNature::Qualitative => None,
        };
        out.push(AnnualRow {
            pair,
            trimester_finals: finals,
            annual_average: annual,
            qualitative,
        });
    }
    Ok(out)
}
