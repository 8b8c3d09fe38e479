// Allow dead_code because these helpers are used across different test files
// which are compiled separately
#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use strongroom::application::{
    EventKind, InMemoryDirectory, LedgerService, Notification, NotificationSink, OwnerStatus,
};
use strongroom::config::LedgerConfig;
use strongroom::domain::{Account, AccountType, Cents, OwnerId};
use tempfile::TempDir;

/// Owners registered in every test directory
pub const ALICE: OwnerId = 1;
pub const BOB: OwnerId = 2;
pub const CAROL: OwnerId = 3;
pub const BLOCKED: OwnerId = 9;

/// Sink that keeps everything it is asked to deliver.
#[derive(Default)]
pub struct RecordingSink {
    delivered: Mutex<Vec<Notification>>,
}

impl RecordingSink {
    pub fn delivered(&self) -> Vec<Notification> {
        self.delivered.lock().unwrap().clone()
    }

    pub fn events_for(&self, recipient: &str) -> Vec<EventKind> {
        self.delivered()
            .into_iter()
            .filter(|n| n.recipient == recipient)
            .map(|n| n.event)
            .collect()
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn deliver(&self, notification: &Notification) -> Result<()> {
        self.delivered.lock().unwrap().push(notification.clone());
        Ok(())
    }
}

/// Sink whose every delivery fails.
pub struct FailingSink;

#[async_trait]
impl NotificationSink for FailingSink {
    async fn deliver(&self, _notification: &Notification) -> Result<()> {
        anyhow::bail!("mail server unreachable")
    }
}

pub struct TestLedger {
    pub service: LedgerService,
    pub sink: Arc<RecordingSink>,
    pub directory: Arc<InMemoryDirectory>,
    _temp_dir: TempDir,
}

pub fn test_config(temp_dir: &TempDir) -> LedgerConfig {
    let db_path = temp_dir.path().join("test.db");
    LedgerConfig {
        lock_timeout: Duration::from_secs(10),
        retry_backoff: Duration::from_millis(5),
        ..LedgerConfig::default()
    }
    .with_database_path(db_path.to_str().unwrap())
}

pub async fn test_directory() -> Arc<InMemoryDirectory> {
    let directory = Arc::new(InMemoryDirectory::new());
    directory
        .register(ALICE, Some("alice@example.com"), OwnerStatus::Active)
        .await;
    directory
        .register(BOB, Some("bob@example.com"), OwnerStatus::Active)
        .await;
    directory.register(CAROL, None, OwnerStatus::Active).await;
    directory
        .register(BLOCKED, Some("blocked@example.com"), OwnerStatus::Blocked)
        .await;
    directory
}

/// Helper to create a test ledger with a temporary database
pub async fn test_ledger() -> Result<TestLedger> {
    let temp_dir = TempDir::new()?;
    let directory = test_directory().await;
    let sink = Arc::new(RecordingSink::default());
    let service =
        LedgerService::init(test_config(&temp_dir), directory.clone(), sink.clone()).await?;

    Ok(TestLedger {
        service,
        sink,
        directory,
        _temp_dir: temp_dir,
    })
}

impl TestLedger {
    /// Open a saving account and fund it with an opening balance.
    pub async fn open(&self, owner: OwnerId, number: &str, balance: Cents) -> Result<Account> {
        Ok(self
            .service
            .accounts()
            .create(owner, number, balance, AccountType::Saving)
            .await?)
    }

    pub async fn balance(&self, account: &Account) -> Result<Cents> {
        Ok(self.service.accounts().get(account.id).await?.balance)
    }

    /// Sum of every balance in the ledger.
    pub async fn total(&self) -> Result<Cents> {
        Ok(self
            .service
            .accounts()
            .list()
            .await?
            .iter()
            .map(|a| a.balance)
            .sum())
    }
}
