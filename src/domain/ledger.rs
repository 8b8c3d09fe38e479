use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{AccountId, Cents, Transaction};

/// Net balance change recorded for an account by a set of ledger rows.
/// Rows belonging to other accounts are ignored.
pub fn compute_net_change<'a>(
    account_id: AccountId,
    transactions: impl IntoIterator<Item = &'a Transaction>,
) -> Cents {
    transactions
        .into_iter()
        .filter(|t| t.account_id == account_id)
        .map(Transaction::signed_delta)
        .sum()
}

/// One statement row with its signed effect and the balance right after it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatementLine {
    pub transaction: Transaction,
    pub delta: Cents,
    pub balance: Cents,
}

/// Read-only view of an account's ledger rows over a date range, as consumed
/// by the statement/export job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Statement {
    pub account_id: AccountId,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    /// Balance before the first row of the period
    pub opening_balance: Cents,
    /// Balance after the last row of the period
    pub closing_balance: Cents,
    pub lines: Vec<StatementLine>,
    pub total_credits: Cents,
    pub total_debits: Cents,
}

impl Statement {
    pub fn net_change(&self) -> Cents {
        self.total_credits - self.total_debits
    }
}

/// Build a statement for `account_id` covering `[from, to]` (inclusive).
///
/// `current_balance` must be the account balance after every row in
/// `transactions`. Rows dated after `to` are rolled back from it to find the
/// closing balance, and the period's rows are rolled back from that to find
/// the opening one.
pub fn build_statement(
    account_id: AccountId,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    current_balance: Cents,
    transactions: &[Transaction],
) -> Statement {
    let mine = transactions.iter().filter(|t| t.account_id == account_id);
    let later = mine.clone().filter(|t| t.date > to);
    let mut rows: Vec<&Transaction> = mine.filter(|t| t.date >= from && t.date <= to).collect();
    rows.sort_by_key(|t| (t.date, t.transaction_id));

    let closing_balance = current_balance - compute_net_change(account_id, later);
    let opening_balance = closing_balance - compute_net_change(account_id, rows.iter().copied());

    let mut balance = opening_balance;
    let mut total_credits = 0;
    let mut total_debits = 0;
    let lines = rows
        .into_iter()
        .map(|t| {
            let delta = t.signed_delta();
            if delta >= 0 {
                total_credits += delta;
            } else {
                total_debits += -delta;
            }
            balance += delta;
            StatementLine {
                transaction: t.clone(),
                delta,
                balance,
            }
        })
        .collect();

    Statement {
        account_id,
        from,
        to,
        opening_balance,
        closing_balance,
        lines,
        total_credits,
        total_debits,
    }
}
