use thiserror::Error;

#[derive(Error, Debug)]
pub enum ComplianceError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },

    #[error("Illegal alert status transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("'{op}' timed out after {after_ms}ms")]
    Timeout { op: &'static str, after_ms: u64 },

    #[error("Unavailable: {0}")]
    Unavailable(String),

    #[error("Rule '{rule_id}' failed to evaluate: {reason}")]
    Evaluation { rule_id: String, reason: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ComplianceError {
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound { kind, id: id.into() }
    }
}

pub type ComplianceResult<T> = Result<T, ComplianceError>;
