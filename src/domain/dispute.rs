use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{OwnerId, TransactionId};

pub type DisputeId = i64;

/// `Pending` moves to exactly one of the two terminal states and never back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisputeStatus {
    Pending,
    Approved,
    Rejected,
}

impl DisputeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisputeStatus::Pending => "pending",
            DisputeStatus::Approved => "approved",
            DisputeStatus::Rejected => "rejected",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Some(DisputeStatus::Pending),
            "approved" => Some(DisputeStatus::Approved),
            "rejected" => Some(DisputeStatus::Rejected),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, DisputeStatus::Pending)
    }

    /// Outcome of a review decision.
    pub fn from_decision(approve: bool) -> Self {
        if approve {
            DisputeStatus::Approved
        } else {
            DisputeStatus::Rejected
        }
    }
}

impl std::fmt::Display for DisputeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A user's claim against one transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dispute {
    pub id: DisputeId,
    pub transaction_id: TransactionId,
    /// Claimant
    pub user_id: OwnerId,
    pub reason: String,
    pub status: DisputeStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
