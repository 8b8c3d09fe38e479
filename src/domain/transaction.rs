use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{AccountId, Cents};

/// Monotonically increasing, never reused.
pub type TransactionId = i64;

/// Which side of a transfer a leg records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LegDirection {
    /// Sender leg: money leaves `account_id` towards `target_account_id`
    Outgoing,
    /// Receiver leg: money arrives in `account_id` from `target_account_id`
    Incoming,
}

impl LegDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            LegDirection::Outgoing => "out",
            LegDirection::Incoming => "in",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "out" => Some(LegDirection::Outgoing),
            "in" => Some(LegDirection::Incoming),
            _ => None,
        }
    }

    pub fn opposite(&self) -> Self {
        match self {
            LegDirection::Outgoing => LegDirection::Incoming,
            LegDirection::Incoming => LegDirection::Outgoing,
        }
    }
}

/// What a ledger row did to the balance of its `account_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Deposit,
    Withdraw,
    TransferLeg(LegDirection),
}

impl TransactionKind {
    /// Value stored in the `type` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Deposit => "deposit",
            TransactionKind::Withdraw => "withdraw",
            TransactionKind::TransferLeg(_) => "transfer",
        }
    }

    /// Value stored in the `direction` column (transfer legs only).
    pub fn direction(&self) -> Option<LegDirection> {
        match self {
            TransactionKind::TransferLeg(direction) => Some(*direction),
            _ => None,
        }
    }

    pub fn from_parts(kind: &str, direction: Option<&str>) -> Option<Self> {
        match (kind, direction) {
            ("deposit", None) => Some(TransactionKind::Deposit),
            ("withdraw", None) => Some(TransactionKind::Withdraw),
            ("transfer", Some(d)) => LegDirection::from_str(d).map(TransactionKind::TransferLeg),
            _ => None,
        }
    }

    /// Balance effect of a row of this kind on its own account.
    ///
    /// This is the only place debit/credit direction is decided; the engine,
    /// the statement builder and every reporting consumer go through it.
    pub fn signed_delta(&self, amount: Cents) -> Cents {
        match self {
            TransactionKind::Deposit | TransactionKind::TransferLeg(LegDirection::Incoming) => {
                amount
            }
            TransactionKind::Withdraw | TransactionKind::TransferLeg(LegDirection::Outgoing) => {
                -amount
            }
        }
    }
}

impl std::fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionKind::TransferLeg(direction) => {
                write!(f, "transfer/{}", direction.as_str())
            }
            other => write!(f, "{}", other.as_str()),
        }
    }
}

/// One row of the ledger. Rows are append-only: apart from `reversed`, nothing
/// changes once the unit that wrote them commits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub transaction_id: TransactionId,
    /// The account whose balance this row explains
    pub account_id: AccountId,
    /// Counterparty account, transfer legs only
    pub target_account_id: Option<AccountId>,
    pub kind: TransactionKind,
    /// Always positive
    pub amount: Cents,
    pub description: String,
    /// Commit time; both legs of a transfer share it
    pub date: DateTime<Utc>,
    /// Set on compensating rows: the transaction being reversed
    pub original_transaction_id: Option<TransactionId>,
    /// The other leg of the same transfer
    pub counterpart_id: Option<TransactionId>,
    pub reversed: bool,
}

impl Transaction {
    pub fn signed_delta(&self) -> Cents {
        self.kind.signed_delta(self.amount)
    }

    /// Returns true if this row compensates an earlier one.
    pub fn is_reversal(&self) -> bool {
        self.original_transaction_id.is_some()
    }

    /// Accounts whose balances move when this row is reversed.
    pub fn accounts_touched(&self) -> Vec<AccountId> {
        match (self.kind, self.target_account_id) {
            (TransactionKind::TransferLeg(_), Some(target)) => vec![self.account_id, target],
            _ => vec![self.account_id],
        }
    }
}
