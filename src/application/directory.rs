use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::domain::OwnerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnerStatus {
    Active,
    Blocked,
}

/// Read access to the external user directory that owns identities.
///
/// The ledger never writes to it: it only asks whether an owner exists and
/// may open accounts, and where to send that owner's notifications.
#[async_trait]
pub trait OwnerDirectory: Send + Sync {
    /// `None` if the owner is unknown.
    async fn owner_status(&self, owner_id: OwnerId) -> anyhow::Result<Option<OwnerStatus>>;

    /// Delivery address for notifications, if the owner has one.
    async fn contact(&self, owner_id: OwnerId) -> anyhow::Result<Option<String>>;
}

#[derive(Debug, Clone)]
struct DirectoryEntry {
    contact: Option<String>,
    status: OwnerStatus,
}

/// Directory kept in memory. Used by tests and embedders without a user store.
#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    owners: RwLock<HashMap<OwnerId, DirectoryEntry>>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, owner_id: OwnerId, contact: Option<&str>, status: OwnerStatus) {
        self.owners.write().await.insert(
            owner_id,
            DirectoryEntry {
                contact: contact.map(str::to_string),
                status,
            },
        );
    }

    /// Returns false if the owner is unknown.
    pub async fn set_status(&self, owner_id: OwnerId, status: OwnerStatus) -> bool {
        match self.owners.write().await.get_mut(&owner_id) {
            Some(entry) => {
                entry.status = status;
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl OwnerDirectory for InMemoryDirectory {
    async fn owner_status(&self, owner_id: OwnerId) -> anyhow::Result<Option<OwnerStatus>> {
        Ok(self.owners.read().await.get(&owner_id).map(|e| e.status))
    }

    async fn contact(&self, owner_id: OwnerId) -> anyhow::Result<Option<String>> {
        Ok(self
            .owners
            .read()
            .await
            .get(&owner_id)
            .and_then(|e| e.contact.clone()))
    }
}

/// Treats every owner id as an active owner without a contact address.
/// The admin CLI runs with this.
#[derive(Debug, Default, Clone, Copy)]
pub struct OpenDirectory;

#[async_trait]
impl OwnerDirectory for OpenDirectory {
    async fn owner_status(&self, _owner_id: OwnerId) -> anyhow::Result<Option<OwnerStatus>> {
        Ok(Some(OwnerStatus::Active))
    }

    async fn contact(&self, _owner_id: OwnerId) -> anyhow::Result<Option<String>> {
        Ok(None)
    }
}
