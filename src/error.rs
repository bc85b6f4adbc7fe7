use serde::Serialize;
use serde_json::json;
use thiserror::Error;

/// One blocking reason. Finalize refusals carry every violation found in a single pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Violation {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
}

impl Violation {
    pub fn for_entity(code: &str, message: impl Into<String>, entity_id: &str) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            entity_id: Some(entity_id.to_string()),
        }
    }
}

#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error("configuration error: {message}")]
    Configuration {
        message: String,
        details: serde_json::Value,
    },

    #[error("incomplete data: {message}")]
    IncompleteData {
        message: String,
        details: serde_json::Value,
    },

    #[error("illegal {machine} transition: {from} -> {to}")]
    IllegalTransition {
        machine: &'static str,
        from: String,
        to: String,
    },

    #[error("precondition failed: {} violation(s)", violations.len())]
    PreconditionFailed { violations: Vec<Violation> },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("{0}")]
    BadParams(String),

    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("{0:#}")]
    Io(#[from] anyhow::Error),
}

impl LifecycleError {
    pub fn not_found(entity: &'static str, id: &str) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn precondition(violations: Vec<Violation>) -> Self {
        Self::PreconditionFailed { violations }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Configuration { .. } => "configuration_error",
            Self::IncompleteData { .. } => "incomplete_data",
            Self::IllegalTransition { .. } => "illegal_transition",
            Self::PreconditionFailed { .. } => "precondition_failed",
            Self::NotFound { .. } => "not_found",
            Self::BadParams(_) => "bad_params",
            Self::Db(_) => "db_query_failed",
            Self::Io(_) => "io_failed",
        }
    }

    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            Self::Configuration { details, .. } | Self::IncompleteData { details, .. } => {
                Some(details.clone())
            }
            Self::IllegalTransition { machine, from, to } => Some(json!({
                "machine": machine,
                "from": from,
                "to": to,
            })),
            Self::PreconditionFailed { violations } => Some(json!({ "violations": violations })),
            Self::NotFound { entity, id } => Some(json!({ "entity": entity, "id": id })),
            Self::BadParams(_) | Self::Db(_) | Self::Io(_) => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, LifecycleError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precondition_details_enumerate_every_violation() {
        let e = LifecycleError::precondition(vec![
            Violation::for_entity("trimester_not_finalized", "Trimester 2 is ACTIVO", "t2"),
            Violation::for_entity("trimester_not_finalized", "Trimester 3 is PENDIENTE", "t3"),
        ]);
        assert_eq!(e.code(), "precondition_failed");
        let details = e.details().expect("details");
        assert_eq!(details["violations"].as_array().map(|v| v.len()), Some(2));
        assert_eq!(details["violations"][1]["entityId"], "t3");
    }

    #[test]
    fn illegal_transition_message_names_both_states() {
        let e = LifecycleError::IllegalTransition {
            machine: "supplementary",
            from: "PENDIENTE".into(),
            to: "CERRADO".into(),
        };
        assert_eq!(
            e.to_string(),
            "illegal supplementary transition: PENDIENTE -> CERRADO"
        );
    }
}
