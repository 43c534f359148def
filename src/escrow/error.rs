//! Escrow error taxonomy

use thiserror::Error;

use crate::gateway::{FailureKind, GatewayError};

/// Persistence failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Record not found: {0}")]
    NotFound(String),

    /// A precondition or uniqueness constraint did not hold; nothing was written
    #[error("State conflict: {0}")]
    Conflict(String),

    #[error("Database error: {0}")]
    Database(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => StoreError::NotFound("row not found".to_string()),
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                StoreError::Conflict(db_err.message().to_string())
            }
            other => StoreError::Database(other.to_string()),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Errors surfaced by the escrow ledger and its collaborators
#[derive(Error, Debug)]
pub enum EscrowError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Storage error: {0}")]
    Store(String),
}

impl EscrowError {
    /// Retry classification when this error ends a transfer attempt. `None`
    /// for infrastructure failures that say nothing about the transfer.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            EscrowError::Validation(_) => Some(FailureKind::Terminal),
            EscrowError::Gateway(err) => Some(err.failure_kind()),
            _ => None,
        }
    }

    /// Whether redelivering the same request could change the result
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, EscrowError::Store(_))
    }
}

impl From<StoreError> for EscrowError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => EscrowError::NotFound(what),
            StoreError::Conflict(what) => EscrowError::InvalidState(what),
            StoreError::Database(what) => EscrowError::Store(what),
        }
    }
}

impl From<validator::ValidationErrors> for EscrowError {
    fn from(err: validator::ValidationErrors) -> Self {
        EscrowError::Validation(err.to_string())
    }
}

pub type EscrowResult<T> = Result<T, EscrowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_mapping() {
        assert!(matches!(
            EscrowError::from(StoreError::Conflict("payout active".to_string())),
            EscrowError::InvalidState(_)
        ));
        assert!(matches!(
            EscrowError::from(StoreError::NotFound("payment".to_string())),
            EscrowError::NotFound(_)
        ));
        assert!(EscrowError::from(StoreError::Database("down".to_string())).is_infrastructure());
    }

    #[test]
    fn test_failure_kind() {
        assert_eq!(
            EscrowError::Validation("no recipient".to_string()).failure_kind(),
            Some(FailureKind::Terminal)
        );
        assert_eq!(
            EscrowError::Gateway(GatewayError::Network("reset".to_string())).failure_kind(),
            Some(FailureKind::Retryable)
        );
        assert_eq!(
            EscrowError::Store("pool timed out".to_string()).failure_kind(),
            None
        );
    }
}
