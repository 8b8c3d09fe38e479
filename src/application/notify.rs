//! Fire-and-forget notifications to account owners.
//!
//! A notification is emitted only after the unit that caused it commits, and a
//! failed delivery never affects the ledger operation. Failures are logged and
//! dropped.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::domain::{DisputeStatus, OwnerId};

use super::OwnerDirectory;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    AccountOpened,
    DepositConfirmed,
    WithdrawConfirmed,
    TransferSent,
    TransferReceived,
    DisputeRaised,
    DisputeResolved(DisputeStatus),
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::AccountOpened => "account_opened",
            EventKind::DepositConfirmed => "deposit_confirmed",
            EventKind::WithdrawConfirmed => "withdraw_confirmed",
            EventKind::TransferSent => "transfer_sent",
            EventKind::TransferReceived => "transfer_received",
            EventKind::DisputeRaised => "dispute_raised",
            EventKind::DisputeResolved(_) => "dispute_resolved",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventKind::DisputeResolved(status) => write!(f, "{} ({})", self.name(), status),
            other => write!(f, "{}", other.name()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub recipient: String,
    pub event: EventKind,
    pub payload: serde_json::Value,
}

/// Outbound delivery channel (email, queue, webhook...).
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(&self, notification: &Notification) -> anyhow::Result<()>;
}

/// Writes notifications to the log instead of delivering them.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn deliver(&self, notification: &Notification) -> anyhow::Result<()> {
        info!(
            recipient = %notification.recipient,
            event = %notification.event,
            payload = %notification.payload,
            "notification"
        );
        Ok(())
    }
}

/// Dispatches notifications on background tasks.
#[derive(Clone)]
pub struct Notifier {
    sink: Arc<dyn NotificationSink>,
    directory: Arc<dyn OwnerDirectory>,
    tasks: Arc<Mutex<JoinSet<()>>>,
}

impl Notifier {
    pub fn new(sink: Arc<dyn NotificationSink>, directory: Arc<dyn OwnerDirectory>) -> Self {
        Self {
            sink,
            directory,
            tasks: Arc::new(Mutex::new(JoinSet::new())),
        }
    }

    /// Queue a notification for `owner_id` and return immediately.
    pub fn dispatch(&self, owner_id: OwnerId, event: EventKind, payload: serde_json::Value) {
        let sink = Arc::clone(&self.sink);
        let directory = Arc::clone(&self.directory);

        let mut tasks = self
            .tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // Reap finished deliveries so the set does not grow without bound
        while tasks.try_join_next().is_some() {}

        tasks.spawn(async move {
            let recipient = match directory.contact(owner_id).await {
                Ok(Some(contact)) => contact,
                Ok(None) => {
                    debug!(owner = owner_id, event = %event, "no contact, notification skipped");
                    return;
                }
                Err(e) => {
                    warn!(owner = owner_id, event = %event, error = %e, "contact lookup failed");
                    return;
                }
            };

            let notification = Notification {
                recipient,
                event,
                payload,
            };
            if let Err(e) = sink.deliver(&notification).await {
                warn!(owner = owner_id, event = %event, error = %e, "notification delivery failed");
            }
        });
    }

    /// Wait for every queued delivery to finish.
    pub async fn drain(&self) {
        let mut pending = {
            let mut tasks = self
                .tasks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            std::mem::take(&mut *tasks)
        };

        while let Some(result) = pending.join_next().await {
            if let Err(e) = result {
                warn!(error = %e, "notification task panicked");
            }
        }
    }
}
