//! Ledger Error Types
//!
//! A single error taxonomy shared by the store, the transaction coordinator
//! and the transfer service. Conflicts reported by the database
//! (`DeadlockDetected`, `SerializationFailure`) are the only retryable kinds.

use thiserror::Error;

use super::models::AccountId;

/// SQLSTATE reported by PostgreSQL when it breaks a lock cycle.
pub const SQLSTATE_DEADLOCK_DETECTED: &str = "40P01";
/// SQLSTATE reported by PostgreSQL for serialization aborts.
pub const SQLSTATE_SERIALIZATION_FAILURE: &str = "40001";

/// Ledger entity kinds, used in `NotFound` errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    Account,
    Entry,
    Transfer,
}

impl Entity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Entity::Account => "account",
            Entity::Entry => "entry",
            Entity::Transfer => "transfer",
        }
    }
}

impl std::fmt::Display for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("{entity} {id} does not exist")]
    NotFound { entity: Entity, id: i64 },

    #[error("Store error: {0}")]
    Store(String),

    #[error("Deadlock detected: {0}")]
    DeadlockDetected(String),

    #[error("Serialization failure: {0}")]
    SerializationFailure(String),

    /// The rollback itself failed. Replaces the error that caused the rollback.
    #[error("Rollback failed: {0}")]
    RollbackFailed(String),

    #[error("Transaction cancelled: deadline exceeded")]
    Cancelled,

    #[error("Amount must be greater than zero, got {0}")]
    InvalidAmount(i64),

    #[error("Insufficient funds in account {account_id}: balance would be {balance} after debiting {amount}")]
    InsufficientFunds {
        account_id: AccountId,
        balance: i64,
        amount: i64,
    },
}

impl LedgerError {
    pub fn account_not_found(id: AccountId) -> Self {
        LedgerError::NotFound {
            entity: Entity::Account,
            id: id.get(),
        }
    }

    pub fn not_found(entity: Entity, id: i64) -> Self {
        LedgerError::NotFound { entity, id }
    }

    /// Conflict aborts: the whole unit of work may be re-run with the same inputs.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LedgerError::DeadlockDetected(_) | LedgerError::SerializationFailure(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, LedgerError::NotFound { .. })
    }

    /// Get the error code for caller-facing responses
    pub fn code(&self) -> &'static str {
        match self {
            LedgerError::NotFound { .. } => "NOT_FOUND",
            LedgerError::Store(_) => "STORE_ERROR",
            LedgerError::DeadlockDetected(_) => "DEADLOCK_DETECTED",
            LedgerError::SerializationFailure(_) => "SERIALIZATION_FAILURE",
            LedgerError::RollbackFailed(_) => "ROLLBACK_FAILED",
            LedgerError::Cancelled => "CANCELLED",
            LedgerError::InvalidAmount(_) => "INVALID_AMOUNT",
            LedgerError::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
        }
    }

    /// Get HTTP status code suggestion
    pub fn http_status(&self) -> u16 {
        match self {
            LedgerError::InvalidAmount(_) => 400,
            LedgerError::NotFound { .. } => 404,
            LedgerError::InsufficientFunds { .. } => 422,
            LedgerError::Store(_) | LedgerError::RollbackFailed(_) => 500,
            LedgerError::DeadlockDetected(_) | LedgerError::SerializationFailure(_) => 503,
            LedgerError::Cancelled => 504,
        }
    }
}

impl From<sqlx::Error> for LedgerError {
    fn from(e: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &e {
            match db.code().as_deref() {
                Some(SQLSTATE_DEADLOCK_DETECTED) => {
                    return LedgerError::DeadlockDetected(db.message().to_string());
                }
                Some(SQLSTATE_SERIALIZATION_FAILURE) => {
                    return LedgerError::SerializationFailure(db.message().to_string());
                }
                _ => {}
            }
        }
        LedgerError::Store(e.to_string())
    }
}

/// Result type for ledger operations.
pub type LedgerResult<T> = Result<T, LedgerError>;
