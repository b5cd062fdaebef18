//! Error types for the transaction participant

use thiserror::Error;

/// Result type for participant operations
pub type Result<T> = std::result::Result<T, TxnError>;

/// User-surfaced errors returned by transaction participant entry points
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TxnError {
    #[error("no such transaction: {0}")]
    NoSuchTransaction(String),

    #[error("transaction committed: {0}")]
    TransactionCommitted(String),

    #[error("transaction too large: {0}")]
    TransactionTooLarge(String),

    #[error("prepared transaction in progress: {0}")]
    PreparedTransactionInProgress(String),

    #[error("conflicting operation in progress: {0}")]
    ConflictingOperationInProgress(String),

    #[error("invalid options: {0}")]
    InvalidOptions(String),

    #[error("operation not supported in transaction: {0}")]
    OperationNotSupportedInTransaction(String),

    #[error("exceeded time limit: {0}")]
    ExceededTimeLimit(String),

    #[error("bad value: {0}")]
    BadValue(String),
}

/// A failure reported by the storage engine.
///
/// On commit paths the participant treats these as fatal; they never
/// propagate past the participant boundary.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("storage engine error: {0}")]
pub struct StorageError(pub String);
