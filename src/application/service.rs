use std::sync::Arc;

use crate::config::LedgerConfig;
use crate::storage::{AccountLocks, Repository};

use super::{
    AccountService, DisputeEngine, LedgerEngine, LedgerError, NotificationSink, Notifier,
    OwnerDirectory,
};

/// Application service providing high-level operations for the ledger.
/// This is the primary interface for any client (CLI, API, jobs).
///
/// All engines share one repository, one lock table and one notifier, so
/// clones of the service coordinate with each other.
#[derive(Clone)]
pub struct LedgerService {
    accounts: AccountService,
    ledger: LedgerEngine,
    disputes: DisputeEngine,
    notifier: Notifier,
}

impl LedgerService {
    /// Wire the engines around an open repository.
    pub fn new(
        repo: Repository,
        config: LedgerConfig,
        directory: Arc<dyn OwnerDirectory>,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        Self::with_locks(repo, config, directory, sink, Arc::new(AccountLocks::new()))
    }

    /// Like [`LedgerService::new`], but coordinating through a lock table
    /// shared with other services over the same database.
    pub fn with_locks(
        repo: Repository,
        config: LedgerConfig,
        directory: Arc<dyn OwnerDirectory>,
        sink: Arc<dyn NotificationSink>,
        locks: Arc<AccountLocks>,
    ) -> Self {
        let config = Arc::new(config);
        let notifier = Notifier::new(sink, Arc::clone(&directory));

        let accounts = AccountService::new(
            repo.clone(),
            Arc::clone(&locks),
            directory,
            notifier.clone(),
            Arc::clone(&config),
        );
        let ledger = LedgerEngine::new(
            repo.clone(),
            locks,
            notifier.clone(),
            Arc::clone(&config),
        );
        let disputes = DisputeEngine::new(repo, ledger.clone(), notifier.clone(), config);

        Self {
            accounts,
            ledger,
            disputes,
            notifier,
        }
    }

    /// Initialize the database (create if missing + migrate) and build the service.
    pub async fn init(
        config: LedgerConfig,
        directory: Arc<dyn OwnerDirectory>,
        sink: Arc<dyn NotificationSink>,
    ) -> Result<Self, LedgerError> {
        let repo = Repository::init(&config).await?;
        Ok(Self::new(repo, config, directory, sink))
    }

    /// Connect to an existing database.
    pub async fn connect(
        config: LedgerConfig,
        directory: Arc<dyn OwnerDirectory>,
        sink: Arc<dyn NotificationSink>,
    ) -> Result<Self, LedgerError> {
        let repo = Repository::connect(&config).await?;
        Ok(Self::new(repo, config, directory, sink))
    }

    pub fn accounts(&self) -> &AccountService {
        &self.accounts
    }

    pub fn ledger(&self) -> &LedgerEngine {
        &self.ledger
    }

    pub fn disputes(&self) -> &DisputeEngine {
        &self.disputes
    }

    /// Wait for notifications that are still being delivered.
    pub async fn drain_notifications(&self) {
        self.notifier.drain().await;
    }
}
