use service_core::error::AppError;
use thiserror::Error;

use crate::models::{MoneyOverflow, SignerRole, UnknownVariant};

/// Failures at the ledger store boundary.
#[derive(Error, Debug)]
pub enum StoreError {
    /// A uniqueness constraint rejected the write.
    #[error("Duplicate: {0}")]
    Duplicate(String),

    /// A conditional write matched no row: the expected prior state was gone.
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Database error: {0}")]
    Database(#[from] anyhow::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                StoreError::Duplicate(db_err.constraint().unwrap_or("unique").to_string())
            }
            other => StoreError::Database(anyhow::Error::new(other)),
        }
    }
}

impl From<UnknownVariant> for StoreError {
    fn from(err: UnknownVariant) -> Self {
        StoreError::Database(anyhow::Error::new(err))
    }
}

impl From<MoneyOverflow> for StoreError {
    fn from(err: MoneyOverflow) -> Self {
        StoreError::Database(anyhow::Error::new(err))
    }
}

/// Failures of lifecycle operations.
#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("This link has expired")]
    LinkExpired,

    #[error("{0}")]
    InvalidState(String),

    #[error("This document has already been signed by {}", .0.label())]
    DuplicateSubmission(SignerRole),

    #[error("{0}")]
    ValidationError(String),

    #[error("{collaborator} failed: {message}")]
    DownstreamFailure {
        collaborator: &'static str,
        message: String,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl LifecycleError {
    pub fn invalid_state(message: impl Into<String>) -> Self {
        LifecycleError::InvalidState(message.into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        LifecycleError::ValidationError(message.into())
    }
}

impl From<MoneyOverflow> for LifecycleError {
    fn from(_: MoneyOverflow) -> Self {
        LifecycleError::validation("Amounts are too large to total")
    }
}

impl From<LifecycleError> for AppError {
    fn from(err: LifecycleError) -> Self {
        match err {
            LifecycleError::NotFound(_) | LifecycleError::LinkExpired => {
                AppError::NotFound(anyhow::anyhow!(err.to_string()))
            }
            LifecycleError::InvalidState(msg) | LifecycleError::ValidationError(msg) => {
                AppError::BadRequest(anyhow::anyhow!(msg))
            }
            LifecycleError::DuplicateSubmission(_) => {
                AppError::BadRequest(anyhow::anyhow!(err.to_string()))
            }
            LifecycleError::DownstreamFailure { .. } => AppError::BadGateway(err.to_string()),
            LifecycleError::Store(StoreError::Database(e)) => AppError::DatabaseError(e),
            LifecycleError::Store(e) => AppError::Conflict(anyhow::anyhow!(e.to_string())),
        }
    }
}
