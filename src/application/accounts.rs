use std::sync::Arc;

use serde_json::json;
use tracing::info;

use crate::config::LedgerConfig;
use crate::domain::{
    Account, AccountId, AccountType, Cents, OwnerId, format_cents, validate_account_number,
};
use crate::storage::{AccountLocks, Repository, is_unique_violation};

use super::unit::{retrying, settle};
use super::{EventKind, LedgerError, Notifier, OwnerDirectory, OwnerStatus};

/// Opens, looks up and deletes accounts. Balances are never written here
/// after creation; that is the ledger engine's job.
#[derive(Clone)]
pub struct AccountService {
    repo: Repository,
    locks: Arc<AccountLocks>,
    directory: Arc<dyn OwnerDirectory>,
    notifier: Notifier,
    config: Arc<LedgerConfig>,
}

impl AccountService {
    pub fn new(
        repo: Repository,
        locks: Arc<AccountLocks>,
        directory: Arc<dyn OwnerDirectory>,
        notifier: Notifier,
        config: Arc<LedgerConfig>,
    ) -> Self {
        Self {
            repo,
            locks,
            directory,
            notifier,
            config,
        }
    }

    /// Open an account for an active owner.
    pub async fn create(
        &self,
        owner_id: OwnerId,
        account_number: &str,
        initial_balance: Cents,
        account_type: AccountType,
    ) -> Result<Account, LedgerError> {
        let prefix = &self.config.account_number_prefix;
        if !validate_account_number(account_number, prefix) {
            return Err(LedgerError::InvalidAccountNumber {
                number: account_number.to_string(),
                prefix: prefix.clone(),
            });
        }
        if initial_balance < 0 {
            return Err(LedgerError::InvalidAmount(format!(
                "opening balance {} is negative",
                format_cents(initial_balance)
            )));
        }

        match self.directory.owner_status(owner_id).await? {
            None => return Err(LedgerError::OwnerNotFound(owner_id)),
            Some(OwnerStatus::Blocked) => return Err(LedgerError::OwnerBlocked(owner_id)),
            Some(OwnerStatus::Active) => {}
        }

        let inserted = self
            .repo
            .insert_account(
                owner_id,
                account_number,
                initial_balance,
                account_type,
                Repository::timestamp(),
            )
            .await;
        let account = match inserted {
            Ok(account) => account,
            Err(e) if is_unique_violation(&e) => {
                return Err(LedgerError::DuplicateAccountNumber(account_number.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        info!(
            account = account.id,
            owner = owner_id,
            number = %account.account_number,
            "account opened"
        );
        self.notifier.dispatch(
            owner_id,
            EventKind::AccountOpened,
            json!({
                "account_number": account.account_number,
                "account_type": account.account_type.as_str(),
                "balance": format_cents(account.balance),
            }),
        );
        Ok(account)
    }

    /// Get an account by ID.
    pub async fn get(&self, account_id: AccountId) -> Result<Account, LedgerError> {
        self.repo
            .get_account(account_id)
            .await?
            .ok_or_else(|| LedgerError::account_not_found(account_id))
    }

    /// Get an account by its account number.
    pub async fn get_by_number(&self, account_number: &str) -> Result<Account, LedgerError> {
        self.repo
            .get_account_by_number(account_number)
            .await?
            .ok_or_else(|| LedgerError::AccountNotFound(account_number.to_string()))
    }

    pub async fn list_by_owner(&self, owner_id: OwnerId) -> Result<Vec<Account>, LedgerError> {
        Ok(self.repo.list_accounts_by_owner(owner_id).await?)
    }

    pub async fn list(&self) -> Result<Vec<Account>, LedgerError> {
        Ok(self.repo.list_accounts().await?)
    }

    /// Delete an account together with every transaction that references it,
    /// on either side. Disputes are kept. Returns the number of ledger rows
    /// removed.
    pub async fn delete(&self, account_id: AccountId) -> Result<u64, LedgerError> {
        let purged = retrying(&self.config, "delete_account", move || {
            self.try_delete(account_id)
        })
        .await?;

        self.locks.forget(account_id);
        info!(account = account_id, transactions = purged, "account deleted");
        Ok(purged)
    }

    /// Delete every account of an owner, each in its own unit. Accounts
    /// removed concurrently are skipped. Returns the deleted accounts with
    /// the number of ledger rows purged for each.
    pub async fn delete_by_owner(
        &self,
        owner_id: OwnerId,
    ) -> Result<Vec<(Account, u64)>, LedgerError> {
        let mut deleted = Vec::new();
        for account in self.repo.list_accounts_by_owner(owner_id).await? {
            match self.delete(account.id).await {
                Ok(purged) => deleted.push((account, purged)),
                Err(LedgerError::AccountNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        info!(owner = owner_id, accounts = deleted.len(), "owner accounts deleted");
        Ok(deleted)
    }

    async fn try_delete(&self, account_id: AccountId) -> Result<u64, LedgerError> {
        let _locks = self
            .locks
            .acquire(&[account_id], self.config.lock_timeout)
            .await?;
        let mut unit = self.repo.begin().await?;

        let result = match Repository::delete_account_cascade(&mut unit, account_id).await {
            Ok(Some(purged)) => Ok(purged),
            Ok(None) => Err(LedgerError::account_not_found(account_id)),
            Err(e) => Err(e.into()),
        };

        settle(unit, result).await
    }
}
