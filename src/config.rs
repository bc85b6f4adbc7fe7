use crate::db;
use crate::error::{LifecycleError, Result};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::json;

pub const SETTINGS_KEY: &str = "grading.config";

/// Decimal places kept on averages, ponderados and finals.
pub const GRADE_DECIMALS: i32 = 2;
pub const SCORE_MIN: f64 = 0.0;
pub const SCORE_MAX: f64 = 10.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PendingEnrollmentPolicy {
    /// Non-graduating students keep ACTIVO and only lose their course binding.
    KeepActive,
    /// Non-graduating students without a forward enrollment become SIN_MATRICULA.
    SinMatricula,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GradingConfig {
    pub band_da_min: f64,
    pub band_aa_min: f64,
    pub band_pa_min: f64,
    pub supletorio_min: f64,
    pub supletorio_max: f64,
    pub supletorio_pass_threshold: f64,
    pub graduation_min: f64,
    pub pending_enrollment_policy: PendingEnrollmentPolicy,
}

impl Default for GradingConfig {
    fn default() -> Self {
        Self {
            band_da_min: 9.0,
            band_aa_min: 7.0,
            band_pa_min: 4.0,
            supletorio_min: 4.0,
            supletorio_max: 6.99,
            supletorio_pass_threshold: 7.0,
            graduation_min: 7.0,
            pending_enrollment_policy: PendingEnrollmentPolicy::SinMatricula,
        }
    }
}

impl GradingConfig {
    pub fn validate(&self) -> Result<()> {
        let in_scale = |v: f64| (SCORE_MIN..=SCORE_MAX).contains(&v);
        let fields = [
            ("bandDaMin", self.band_da_min),
            ("bandAaMin", self.band_aa_min),
            ("bandPaMin", self.band_pa_min),
            ("supletorioMin", self.supletorio_min),
            ("supletorioMax", self.supletorio_max),
            ("supletorioPassThreshold", self.supletorio_pass_threshold),
            ("graduationMin", self.graduation_min),
        ];
        let out_of_scale: Vec<&str> = fields
            .iter()
            .filter(|(_, v)| !in_scale(*v))
            .map(|(k, _)| *k)
            .collect();
        if !out_of_scale.is_empty() {
            return Err(LifecycleError::Configuration {
                message: format!("values must be within {}..={}", SCORE_MIN, SCORE_MAX),
                details: json!({ "fields": out_of_scale }),
            });
        }
        if !(self.band_pa_min < self.band_aa_min && self.band_aa_min < self.band_da_min) {
            return Err(LifecycleError::Configuration {
                message: "band cut points must satisfy PA < AA < DA".to_string(),
                details: json!({
                    "bandPaMin": self.band_pa_min,
                    "bandAaMin": self.band_aa_min,
                    "bandDaMin": self.band_da_min,
                }),
            });
        }
        if self.supletorio_min > self.supletorio_max {
            return Err(LifecycleError::Configuration {
                message: "supletorioMin must be <= supletorioMax".to_string(),
                details: json!({
                    "supletorioMin": self.supletorio_min,
                    "supletorioMax": self.supletorio_max,
                }),
            });
        }
        Ok(())
    }
}

/// Saved override, or defaults when nothing was saved.
pub fn load(conn: &Connection) -> Result<GradingConfig> {
    let Some(saved) = db::settings_get_json(conn, SETTINGS_KEY)? else {
        return Ok(GradingConfig::default());
    };
    serde_json::from_value(saved).map_err(|e| LifecycleError::Configuration {
        message: format!("stored grading config is invalid: {}", e),
        details: json!({ "key": SETTINGS_KEY }),
    })
}

/// Applies a camelCase patch over the current config and persists it.
pub fn update(conn: &Connection, patch: &serde_json::Value) -> Result<GradingConfig> {
    let Some(patch_obj) = patch.as_object() else {
        return Err(LifecycleError::BadParams("patch must be an object".into()));
    };
    let mut merged = serde_json::to_value(load(conn)?)
        .map_err(|e| LifecycleError::BadParams(e.to_string()))?;
    let Some(merged_obj) = merged.as_object_mut() else {
        return Err(LifecycleError::BadParams("config must be an object".into()));
    };
    for (k, v) in patch_obj {
        if !merged_obj.contains_key(k) {
            return Err(LifecycleError::BadParams(format!(
                "unknown grading config field: {}",
                k
            )));
        }
        merged_obj.insert(k.clone(), v.clone());
    }
    let cfg: GradingConfig =
        serde_json::from_value(merged).map_err(|e| LifecycleError::BadParams(e.to_string()))?;
    cfg.validate()?;
    let stored =
        serde_json::to_value(&cfg).map_err(|e| LifecycleError::BadParams(e.to_string()))?;
    db::settings_set_json(conn, SETTINGS_KEY, &stored)?;
    tracing::info!(?cfg, "grading config updated");
    Ok(cfg)
}

pub fn clear_override(conn: &Connection) -> Result<GradingConfig> {
    db::settings_delete(conn, SETTINGS_KEY)?;
    Ok(GradingConfig::default())
}
