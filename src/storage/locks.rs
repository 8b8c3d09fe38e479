//! Per-account exclusive locks.
//!
//! Every unit that writes a balance holds the lock of each account it touches
//! for its whole duration. Locks are always taken in ascending account id
//! order, so two units over the same pair of accounts can never wait on each
//! other in a cycle.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::time::Instant;
use tracing::debug;

use crate::application::LedgerError;
use crate::domain::AccountId;

#[derive(Default)]
pub struct AccountLocks {
    table: Mutex<HashMap<AccountId, Arc<AsyncMutex<()>>>>,
}

/// Locks held by one unit of work. Dropping it releases all of them.
pub struct LockSet {
    accounts: Vec<AccountId>,
    _guards: Vec<OwnedMutexGuard<()>>,
}

impl AccountLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock every account in `ids` (duplicates allowed) in ascending id order.
    ///
    /// The whole acquisition is bounded by `timeout`; on expiry every lock
    /// already taken is released and `LockTimeout` is returned.
    pub async fn acquire(
        &self,
        ids: &[AccountId],
        timeout: Duration,
    ) -> Result<LockSet, LedgerError> {
        let mut accounts = ids.to_vec();
        accounts.sort_unstable();
        accounts.dedup();

        let deadline = Instant::now() + timeout;
        let mut guards = Vec::with_capacity(accounts.len());

        for &id in &accounts {
            let mutex = self.entry(id);
            match tokio::time::timeout_at(deadline, mutex.lock_owned()).await {
                Ok(guard) => guards.push(guard),
                Err(_) => {
                    debug!(account = id, "lock wait expired");
                    return Err(LedgerError::LockTimeout(format!("account #{}", id)));
                }
            }
        }

        Ok(LockSet {
            accounts,
            _guards: guards,
        })
    }

    /// Drop the table entry of a deleted account.
    pub fn forget(&self, id: AccountId) {
        self.table
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&id);
    }

    fn entry(&self, id: AccountId) -> Arc<AsyncMutex<()>> {
        self.table
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(id)
            .or_default()
            .clone()
    }
}

impl LockSet {
    /// Locked accounts, ascending.
    pub fn accounts(&self) -> &[AccountId] {
        &self.accounts
    }

    pub fn covers(&self, id: AccountId) -> bool {
        self.accounts.binary_search(&id).is_ok()
    }

    /// Fail loudly if a unit is about to write an account it did not lock.
    pub fn ensure(&self, id: AccountId) -> Result<(), LedgerError> {
        if self.covers(id) {
            Ok(())
        } else {
            Err(LedgerError::InvariantViolation(format!(
                "account #{} written without holding its lock",
                id
            )))
        }
    }
}
