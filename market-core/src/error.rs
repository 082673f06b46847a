use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::LeadStatus;

pub type MarketResult<T> = Result<T, MarketError>;

/// A single field-level validation failure, shown next to the offending input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationErrors {
    pub errors: Vec<FieldError>,
}

impl ValidationErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, field: &str, message: impl Into<String>) {
        self.errors.push(FieldError {
            field: field.to_string(),
            message: message.into(),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn has(&self, field: &str) -> bool {
        self.errors.iter().any(|e| e.field == field)
    }

    pub fn merge(&mut self, other: ValidationErrors) {
        self.errors.extend(other.errors);
    }

    /// `Ok(())` when nothing was recorded.
    pub fn into_result(self) -> MarketResult<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(MarketError::Validation(self))
        }
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .errors
            .iter()
            .map(|e| format!("{}: {}", e.field, e.message))
            .collect();
        write!(f, "{}", parts.join("; "))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MarketError {
    #[error("not signed in")]
    Unauthenticated,

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("validation failed: {0}")]
    Validation(ValidationErrors),

    #[error("insufficient balance: {balance} coins available, {required} required")]
    InsufficientBalance { balance: i64, required: i64 },

    #[error("lead {lead_id} is already {status}")]
    LeadAlreadyDecided { lead_id: String, status: LeadStatus },

    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A procedure answered `{success: false, error}`.
    #[error("{0}")]
    Rejected(String),

    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl MarketError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        MarketError::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn validation(field: &str, message: impl Into<String>) -> Self {
        let mut errors = ValidationErrors::new();
        errors.add(field, message);
        MarketError::Validation(errors)
    }

    /// Short machine-readable code used in API error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            MarketError::Unauthenticated => "unauthenticated",
            MarketError::Forbidden(_) => "forbidden",
            MarketError::NotFound { .. } => "not_found",
            MarketError::Validation(_) => "validation_failed",
            MarketError::InsufficientBalance { .. } => "insufficient_balance",
            MarketError::LeadAlreadyDecided { .. } => "lead_already_decided",
            MarketError::InvalidState(_) => "invalid_state",
            MarketError::Rejected(_) => "rejected",
            MarketError::Database(_) => "database_error",
            MarketError::Internal(_) => "internal_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_errors_into_result() {
        assert!(ValidationErrors::new().into_result().is_ok());

        let mut errors = ValidationErrors::new();
        errors.add("budget_min", "must not exceed budget_max");
        let err = errors.into_result().unwrap_err();
        match err {
            MarketError::Validation(v) => assert!(v.has("budget_min")),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_error_display() {
        let err = MarketError::InsufficientBalance {
            balance: 50,
            required: 100,
        };
        assert_eq!(
            err.to_string(),
            "insufficient balance: 50 coins available, 100 required"
        );
        assert_eq!(err.code(), "insufficient_balance");
    }
}
