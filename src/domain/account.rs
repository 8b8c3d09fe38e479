use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Cents;

/// Numeric account identifier. Its ordering is the global lock order.
pub type AccountId = i64;

/// Reference to a user in the external owner directory.
pub type OwnerId = i64;

/// Prefix every account number must start with unless configured otherwise.
pub const DEFAULT_ACCOUNT_NUMBER_PREFIX: &str = "ACC";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountType {
    Saving,
    Current,
}

impl AccountType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountType::Saving => "saving",
            AccountType::Current => "current",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "saving" | "savings" => Some(AccountType::Saving),
            "current" => Some(AccountType::Current),
            _ => None,
        }
    }
}

impl std::fmt::Display for AccountType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A customer account. The balance is only ever written by the ledger engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub owner_id: OwnerId,
    /// Unique and immutable after creation
    pub account_number: String,
    /// Never negative
    pub balance: Cents,
    pub account_type: AccountType,
    pub created_at: DateTime<Utc>,
}

/// Returns true if `number` carries the required prefix followed by at least
/// one more ASCII alphanumeric character.
pub fn validate_account_number(number: &str, prefix: &str) -> bool {
    match number.strip_prefix(prefix) {
        Some(rest) => !rest.is_empty() && rest.chars().all(|c| c.is_ascii_alphanumeric()),
        None => false,
    }
}
