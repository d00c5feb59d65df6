//! Core error types.
//!
//! Only genuine failures live here. Declined deductions, consumed trials and
//! redelivered payment events are ordinary return values of the operations
//! that produce them.

use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in the subscription, metering and history core.
#[derive(Debug, Error)]
pub enum CoreError {
    /// No subscription, plan, package or record exists for the given key.
    #[error("not found: {0}")]
    NotFound(String),

    /// Missing or malformed input, rejected before touching storage.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The record is in a state the requested transition does not start from.
    #[error("invalid transition: cannot {action} a subscription in status '{status}'")]
    InvalidTransition {
        action: &'static str,
        status: String,
    },

    /// The payment provider could not create a checkout.
    #[error("payment provider failure: {0}")]
    Provider(String),

    /// The persistence layer failed.
    #[error("storage failure: {0}")]
    Storage(#[from] sqlx::Error),

    /// Schema migration failed.
    #[error("migration failure: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

impl CoreError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn provider(msg: impl Into<String>) -> Self {
        Self::Provider(msg.into())
    }

    /// Whether retrying the same call later could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Storage(_) | Self::Provider(_))
    }
}
