use thiserror::Error;

use crate::domain::{
    AccountId, Cents, DisputeId, DisputeStatus, OwnerId, TransactionId, format_cents,
};

/// Broad class of a [`LedgerError`], telling the caller whether and how to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad input, rejected before any lock is taken. Retry only with corrected input.
    Validation,
    /// Rejected after reading current state. Re-fetch before trying again.
    Conflict,
    /// Transient; safe to retry with backoff, nothing was applied.
    Resource,
    /// Something that must never happen did. Never retried.
    Invariant,
}

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Cannot transfer to the same account: {0}")]
    SameAccount(String),

    #[error("Invalid account number '{number}': must start with '{prefix}' followed by letters or digits")]
    InvalidAccountNumber { number: String, prefix: String },

    #[error("Invalid dispute reason: {0}")]
    InvalidReason(String),

    #[error("Account not found: {0}")]
    AccountNotFound(String),

    #[error("Target account not found: {0}")]
    TargetNotFound(String),

    #[error("Transaction not found: {0}")]
    TransactionNotFound(TransactionId),

    #[error("Dispute not found: {0}")]
    DisputeNotFound(DisputeId),

    #[error("Owner not found: {0}")]
    OwnerNotFound(OwnerId),

    #[error("Insufficient balance in account {account_number}: balance {}, required {}", money(.balance), money(.required))]
    InsufficientBalance {
        account_number: String,
        balance: Cents,
        required: Cents,
    },

    #[error("Cannot reverse: account {account_number} holds {}, reversal needs {}", money(.balance), money(.required))]
    InsufficientBalanceForReversal {
        account_number: String,
        balance: Cents,
        required: Cents,
    },

    #[error("Account number already exists: {0}")]
    DuplicateAccountNumber(String),

    #[error("Owner {0} is blocked and cannot open accounts")]
    OwnerBlocked(OwnerId),

    #[error("Transaction {0} already has a pending dispute")]
    DuplicatePendingDispute(TransactionId),

    #[error("Dispute {dispute_id} was already reviewed ({status})")]
    AlreadyReviewed {
        dispute_id: DisputeId,
        status: DisputeStatus,
    },

    #[error("Transaction {0} is already reversed or is itself a reversal")]
    AlreadyReversed(TransactionId),

    #[error("Timed out waiting for a lock: {0}")]
    LockTimeout(String),

    #[error("Ledger invariant violated: {0}")]
    InvariantViolation(String),

    #[error("Storage error: {0:#}")]
    Storage(anyhow::Error),
}

impl LedgerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LedgerError::InvalidAmount(_)
            | LedgerError::SameAccount(_)
            | LedgerError::InvalidAccountNumber { .. }
            | LedgerError::InvalidReason(_) => ErrorKind::Validation,

            LedgerError::AccountNotFound(_)
            | LedgerError::TargetNotFound(_)
            | LedgerError::TransactionNotFound(_)
            | LedgerError::DisputeNotFound(_)
            | LedgerError::OwnerNotFound(_)
            | LedgerError::InsufficientBalance { .. }
            | LedgerError::InsufficientBalanceForReversal { .. }
            | LedgerError::DuplicateAccountNumber(_)
            | LedgerError::OwnerBlocked(_)
            | LedgerError::DuplicatePendingDispute(_)
            | LedgerError::AlreadyReviewed { .. }
            | LedgerError::AlreadyReversed(_) => ErrorKind::Conflict,

            LedgerError::LockTimeout(_) | LedgerError::Storage(_) => ErrorKind::Resource,

            LedgerError::InvariantViolation(_) => ErrorKind::Invariant,
        }
    }

    /// Only lock contention is retried internally; everything else needs new
    /// input or fresh state from the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::LockTimeout(_))
    }

    pub(crate) fn account_not_found(id: AccountId) -> Self {
        LedgerError::AccountNotFound(format!("#{}", id))
    }
}

fn money(cents: &Cents) -> String {
    format_cents(*cents)
}

/// SQLite primary result codes that mean "another writer holds the database".
const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;

impl From<anyhow::Error> for LedgerError {
    fn from(err: anyhow::Error) -> Self {
        if let Some(sql_err) = err.downcast_ref::<sqlx::Error>() {
            match sql_err {
                sqlx::Error::PoolTimedOut => {
                    return LedgerError::LockTimeout("no database connection available".into());
                }
                sqlx::Error::Database(db_err) => {
                    let code = db_err
                        .code()
                        .and_then(|c| c.parse::<i32>().ok())
                        .map(|c| c & 0xff);
                    if matches!(code, Some(SQLITE_BUSY) | Some(SQLITE_LOCKED)) {
                        return LedgerError::LockTimeout(db_err.message().to_string());
                    }
                    if db_err.is_check_violation() {
                        return LedgerError::InvariantViolation(db_err.message().to_string());
                    }
                }
                _ => {}
            }
        }
        LedgerError::Storage(err)
    }
}

impl From<sqlx::Error> for LedgerError {
    fn from(err: sqlx::Error) -> Self {
        LedgerError::from(anyhow::Error::from(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            LedgerError::InvalidAmount("x".into()).kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            LedgerError::InsufficientBalance {
                account_number: "ACC1".into(),
                balance: 100,
                required: 200,
            }
            .kind(),
            ErrorKind::Conflict
        );
        assert_eq!(LedgerError::LockTimeout("x".into()).kind(), ErrorKind::Resource);
        assert_eq!(
            LedgerError::InvariantViolation("x".into()).kind(),
            ErrorKind::Invariant
        );
    }

    #[test]
    fn test_only_lock_timeouts_retry() {
        assert!(LedgerError::LockTimeout("busy".into()).is_retryable());
        assert!(!LedgerError::AlreadyReversed(7).is_retryable());
        assert!(!LedgerError::Storage(anyhow::anyhow!("disk")).is_retryable());
    }

    #[test]
    fn test_pool_timeout_maps_to_lock_timeout() {
        let err = LedgerError::from(anyhow::Error::from(sqlx::Error::PoolTimedOut));
        assert!(matches!(err, LedgerError::LockTimeout(_)));

        let wrapped =
            anyhow::Error::from(sqlx::Error::PoolTimedOut).context("Failed to begin unit");
        assert!(matches!(LedgerError::from(wrapped), LedgerError::LockTimeout(_)));
    }

    #[test]
    fn test_display_formats_money() {
        let err = LedgerError::InsufficientBalance {
            account_number: "ACC1".into(),
            balance: 10000,
            required: 15000,
        };
        assert_eq!(
            err.to_string(),
            "Insufficient balance in account ACC1: balance 100.00, required 150.00"
        );
    }
}
