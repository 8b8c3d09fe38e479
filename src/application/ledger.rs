use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;
use sqlx::SqliteConnection;
use tracing::{debug, info};

use crate::config::LedgerConfig;
use crate::domain::{
    Account, AccountId, Cents, LegDirection, Statement, Transaction, TransactionId,
    TransactionKind, build_statement, format_cents,
};
use crate::storage::{AccountLocks, LockSet, NewEntry, NewTransfer, Repository};

use super::unit::{retrying, settle};
use super::{EventKind, LedgerError, Notifier};

/// Outcome of a deposit or withdrawal.
#[derive(Debug, Clone)]
pub struct Posting {
    /// The account after the change
    pub account: Account,
    pub transaction: Transaction,
}

impl Posting {
    pub fn balance(&self) -> Cents {
        self.account.balance
    }
}

/// Outcome of a transfer: both accounts after the change and both legs.
#[derive(Debug, Clone)]
pub struct TransferReceipt {
    pub from: Account,
    pub to: Account,
    pub sent: Transaction,
    pub received: Transaction,
}

/// Outcome of a reversal.
#[derive(Debug, Clone)]
pub struct Reversal {
    /// The reversed transaction, now marked reversed
    pub original: Transaction,
    /// The other leg, when a transfer was reversed
    pub counterpart: Option<Transaction>,
    /// Rows written to undo the original
    pub compensating: Vec<Transaction>,
    /// Every account whose balance moved, after the change
    pub accounts: Vec<Account>,
}

/// Applies deposits, withdrawals, transfers and reversals.
///
/// Every mutation locks the accounts it touches (ascending id order), runs as
/// one unit and notifies owners only after the unit commits.
#[derive(Clone)]
pub struct LedgerEngine {
    repo: Repository,
    locks: Arc<AccountLocks>,
    notifier: Notifier,
    config: Arc<LedgerConfig>,
}

impl LedgerEngine {
    pub fn new(
        repo: Repository,
        locks: Arc<AccountLocks>,
        notifier: Notifier,
        config: Arc<LedgerConfig>,
    ) -> Self {
        Self {
            repo,
            locks,
            notifier,
            config,
        }
    }

    // ========================
    // Postings
    // ========================

    /// Credit `amount` to an account.
    pub async fn deposit(
        &self,
        account_id: AccountId,
        amount: Cents,
    ) -> Result<Posting, LedgerError> {
        validate_amount(amount)?;
        let posting = retrying(&self.config, "deposit", move || {
            self.try_deposit(account_id, amount)
        })
        .await?;

        info!(
            account = account_id,
            amount,
            transaction = posting.transaction.transaction_id,
            balance = posting.balance(),
            "deposit committed"
        );
        self.notifier.dispatch(
            posting.account.owner_id,
            EventKind::DepositConfirmed,
            json!({
                "account_number": posting.account.account_number,
                "amount": format_cents(amount),
                "balance": format_cents(posting.balance()),
                "transaction_id": posting.transaction.transaction_id,
            }),
        );
        Ok(posting)
    }

    async fn try_deposit(
        &self,
        account_id: AccountId,
        amount: Cents,
    ) -> Result<Posting, LedgerError> {
        let locks = self.lock_accounts(&[account_id]).await?;
        let mut unit = self.repo.begin().await?;

        let result: Result<Posting, LedgerError> = async {
            locks.ensure(account_id)?;
            let account = match Repository::credit(&mut unit, account_id, amount).await? {
                Some(account) => account,
                None => return Err(credit_failure(&mut unit, account_id).await),
            };
            let transaction = Repository::insert_entry(
                &mut unit,
                &NewEntry {
                    account_id,
                    kind: TransactionKind::Deposit,
                    amount,
                    description: "Deposit",
                    date: Repository::timestamp(),
                    original_transaction_id: None,
                    reversed: false,
                },
            )
            .await?;
            Ok(Posting {
                account,
                transaction,
            })
        }
        .await;

        settle(unit, result).await
    }

    /// Debit `amount` from an account. The balance check and the decrement
    /// are a single conditional update.
    pub async fn withdraw(
        &self,
        account_id: AccountId,
        amount: Cents,
    ) -> Result<Posting, LedgerError> {
        validate_amount(amount)?;
        let posting = retrying(&self.config, "withdraw", move || {
            self.try_withdraw(account_id, amount)
        })
        .await?;

        info!(
            account = account_id,
            amount,
            transaction = posting.transaction.transaction_id,
            balance = posting.balance(),
            "withdrawal committed"
        );
        self.notifier.dispatch(
            posting.account.owner_id,
            EventKind::WithdrawConfirmed,
            json!({
                "account_number": posting.account.account_number,
                "amount": format_cents(amount),
                "balance": format_cents(posting.balance()),
                "transaction_id": posting.transaction.transaction_id,
            }),
        );
        Ok(posting)
    }

    async fn try_withdraw(
        &self,
        account_id: AccountId,
        amount: Cents,
    ) -> Result<Posting, LedgerError> {
        let locks = self.lock_accounts(&[account_id]).await?;
        let mut unit = self.repo.begin().await?;

        let result: Result<Posting, LedgerError> = async {
            locks.ensure(account_id)?;
            let account = match Repository::debit(&mut unit, account_id, amount).await? {
                Some(account) => account,
                None => {
                    return Err(match Repository::find_account(&mut unit, account_id).await? {
                        None => LedgerError::account_not_found(account_id),
                        Some(account) => LedgerError::InsufficientBalance {
                            account_number: account.account_number,
                            balance: account.balance,
                            required: amount,
                        },
                    });
                }
            };
            let transaction = Repository::insert_entry(
                &mut unit,
                &NewEntry {
                    account_id,
                    kind: TransactionKind::Withdraw,
                    amount,
                    description: "Withdraw cash",
                    date: Repository::timestamp(),
                    original_transaction_id: None,
                    reversed: false,
                },
            )
            .await?;
            Ok(Posting {
                account,
                transaction,
            })
        }
        .await;

        settle(unit, result).await
    }

    /// Move `amount` from an account to the account numbered `to_account_number`.
    ///
    /// Both balance writes and both legs commit together or not at all.
    pub async fn transfer(
        &self,
        from_account_id: AccountId,
        to_account_number: &str,
        amount: Cents,
    ) -> Result<TransferReceipt, LedgerError> {
        validate_amount(amount)?;
        let target = self
            .repo
            .get_account_by_number(to_account_number)
            .await?
            .ok_or_else(|| LedgerError::TargetNotFound(to_account_number.to_string()))?;
        if target.id == from_account_id {
            return Err(LedgerError::SameAccount(to_account_number.to_string()));
        }

        let target = &target;
        let receipt = retrying(&self.config, "transfer", move || {
            self.try_transfer(from_account_id, target, amount)
        })
        .await?;

        info!(
            from = receipt.from.id,
            to = receipt.to.id,
            amount,
            sent = receipt.sent.transaction_id,
            received = receipt.received.transaction_id,
            "transfer committed"
        );
        self.notifier.dispatch(
            receipt.from.owner_id,
            EventKind::TransferSent,
            json!({
                "account_number": receipt.from.account_number,
                "to_account_number": receipt.to.account_number,
                "amount": format_cents(amount),
                "balance": format_cents(receipt.from.balance),
                "transaction_id": receipt.sent.transaction_id,
            }),
        );
        self.notifier.dispatch(
            receipt.to.owner_id,
            EventKind::TransferReceived,
            json!({
                "account_number": receipt.to.account_number,
                "from_account_number": receipt.from.account_number,
                "amount": format_cents(amount),
                "balance": format_cents(receipt.to.balance),
                "transaction_id": receipt.received.transaction_id,
            }),
        );
        Ok(receipt)
    }

    async fn try_transfer(
        &self,
        from_id: AccountId,
        target: &Account,
        amount: Cents,
    ) -> Result<TransferReceipt, LedgerError> {
        let locks = self.lock_accounts(&[from_id, target.id]).await?;
        let mut unit = self.repo.begin().await?;

        let result: Result<TransferReceipt, LedgerError> = async {
            locks.ensure(from_id)?;
            locks.ensure(target.id)?;

            let from = match Repository::debit(&mut unit, from_id, amount).await? {
                Some(account) => account,
                None => {
                    return Err(match Repository::find_account(&mut unit, from_id).await? {
                        None => LedgerError::account_not_found(from_id),
                        Some(account) => LedgerError::InsufficientBalance {
                            account_number: account.account_number,
                            balance: account.balance,
                            required: amount,
                        },
                    });
                }
            };
            let to = match Repository::credit(&mut unit, target.id, amount).await? {
                Some(account) => account,
                None => {
                    return Err(match Repository::find_account(&mut unit, target.id).await? {
                        None => LedgerError::TargetNotFound(target.account_number.clone()),
                        Some(_) => balance_overflow(target.id),
                    });
                }
            };

            let sent_description =
                format!("Transfer {} to {}", format_cents(amount), to.account_number);
            let received_description =
                format!("Received {} from {}", format_cents(amount), from.account_number);
            let (sent, received) = Repository::insert_transfer_legs(
                &mut unit,
                &NewTransfer {
                    from: from.id,
                    to: to.id,
                    amount,
                    sent_description: &sent_description,
                    received_description: &received_description,
                    date: Repository::timestamp(),
                    original_transaction_id: None,
                    reversed: false,
                },
            )
            .await?;

            Ok(TransferReceipt {
                from,
                to,
                sent,
                received,
            })
        }
        .await;

        settle(unit, result).await
    }

    // ========================
    // Reversals
    // ========================

    /// Undo a committed transaction. For a transfer either leg may be named;
    /// both legs are reversed.
    pub async fn reverse_transaction(
        &self,
        transaction_id: TransactionId,
    ) -> Result<Reversal, LedgerError> {
        let reversal = retrying(&self.config, "reverse", move || {
            self.try_reverse(transaction_id)
        })
        .await?;

        let compensating: Vec<TransactionId> = reversal
            .compensating
            .iter()
            .map(|t| t.transaction_id)
            .collect();
        info!(transaction = transaction_id, compensating = ?compensating, "reversal committed");
        Ok(reversal)
    }

    async fn try_reverse(&self, transaction_id: TransactionId) -> Result<Reversal, LedgerError> {
        let original = self
            .repo
            .get_transaction(transaction_id)
            .await?
            .ok_or(LedgerError::TransactionNotFound(transaction_id))?;
        if original.reversed {
            return Err(LedgerError::AlreadyReversed(transaction_id));
        }

        let locks = self.lock_accounts(&original.accounts_touched()).await?;
        let mut unit = self.repo.begin().await?;
        let result = Self::apply_reversal(&mut unit, &locks, transaction_id).await;
        settle(unit, result).await
    }

    /// Reverse a transaction inside an open unit. The caller must hold the
    /// locks of every account the transaction touches.
    ///
    /// The first statement claims the row (`reversed` 0 to 1), so of two
    /// concurrent reversals only one ever gets past it.
    pub(crate) async fn apply_reversal(
        conn: &mut SqliteConnection,
        locks: &LockSet,
        transaction_id: TransactionId,
    ) -> Result<Reversal, LedgerError> {
        let original = match Repository::claim_for_reversal(conn, transaction_id).await? {
            Some(row) => row,
            None => {
                return Err(match Repository::find_transaction(conn, transaction_id).await? {
                    None => LedgerError::TransactionNotFound(transaction_id),
                    Some(_) => LedgerError::AlreadyReversed(transaction_id),
                });
            }
        };
        for account_id in original.accounts_touched() {
            locks.ensure(account_id)?;
        }

        let description = format!("Reversal of {} #{}", original.kind.as_str(), transaction_id);
        let date = Repository::timestamp();

        match original.kind {
            TransactionKind::Deposit => {
                let account = debit_for_reversal(conn, original.account_id, original.amount).await?;
                let row = Repository::insert_entry(
                    conn,
                    &NewEntry {
                        account_id: original.account_id,
                        kind: TransactionKind::Withdraw,
                        amount: original.amount,
                        description: &description,
                        date,
                        original_transaction_id: Some(transaction_id),
                        reversed: true,
                    },
                )
                .await?;
                Ok(Reversal {
                    original,
                    counterpart: None,
                    compensating: vec![row],
                    accounts: vec![account],
                })
            }
            TransactionKind::Withdraw => {
                let credited =
                    Repository::credit(conn, original.account_id, original.amount).await?;
                let account = match credited {
                    Some(account) => account,
                    None => return Err(credit_failure(conn, original.account_id).await),
                };
                let row = Repository::insert_entry(
                    conn,
                    &NewEntry {
                        account_id: original.account_id,
                        kind: TransactionKind::Deposit,
                        amount: original.amount,
                        description: &description,
                        date,
                        original_transaction_id: Some(transaction_id),
                        reversed: true,
                    },
                )
                .await?;
                Ok(Reversal {
                    original,
                    counterpart: None,
                    compensating: vec![row],
                    accounts: vec![account],
                })
            }
            TransactionKind::TransferLeg(direction) => {
                let counterpart_id = original.counterpart_id.ok_or_else(|| {
                    LedgerError::InvariantViolation(format!(
                        "transfer leg #{} has no counterpart",
                        transaction_id
                    ))
                })?;
                let other = original.target_account_id.ok_or_else(|| {
                    LedgerError::InvariantViolation(format!(
                        "transfer leg #{} has no target account",
                        transaction_id
                    ))
                })?;
                let counterpart = Repository::claim_for_reversal(conn, counterpart_id)
                    .await?
                    .ok_or_else(|| {
                        LedgerError::InvariantViolation(format!(
                            "counterpart #{} of transfer leg #{} is missing or already reversed",
                            counterpart_id, transaction_id
                        ))
                    })?;
                if counterpart.amount != original.amount
                    || counterpart.kind != TransactionKind::TransferLeg(direction.opposite())
                {
                    return Err(LedgerError::InvariantViolation(format!(
                        "transfer legs #{} and #{} do not match",
                        transaction_id, counterpart_id
                    )));
                }

                let (sender, receiver) = match direction {
                    LegDirection::Outgoing => (original.account_id, other),
                    LegDirection::Incoming => (other, original.account_id),
                };

                let receiver_account = debit_for_reversal(conn, receiver, original.amount).await?;
                let credited = Repository::credit(conn, sender, original.amount).await?;
                let sender_account = match credited {
                    Some(account) => account,
                    None => return Err(credit_failure(conn, sender).await),
                };

                let received_description = format!(
                    "Reversal of transfer #{}: {} returned from {}",
                    transaction_id,
                    format_cents(original.amount),
                    receiver_account.account_number
                );
                let (returned, refunded) = Repository::insert_transfer_legs(
                    conn,
                    &NewTransfer {
                        from: receiver,
                        to: sender,
                        amount: original.amount,
                        sent_description: &description,
                        received_description: &received_description,
                        date,
                        original_transaction_id: Some(transaction_id),
                        reversed: true,
                    },
                )
                .await?;

                Ok(Reversal {
                    original,
                    counterpart: Some(counterpart),
                    compensating: vec![returned, refunded],
                    accounts: vec![receiver_account, sender_account],
                })
            }
        }
    }

    // ========================
    // Read side
    // ========================

    /// Get a ledger row by ID.
    pub async fn get_transaction(
        &self,
        transaction_id: TransactionId,
    ) -> Result<Transaction, LedgerError> {
        self.repo
            .get_transaction(transaction_id)
            .await?
            .ok_or(LedgerError::TransactionNotFound(transaction_id))
    }

    /// Every ledger row of an account, oldest first.
    pub async fn transactions_for(
        &self,
        account_id: AccountId,
    ) -> Result<Vec<Transaction>, LedgerError> {
        self.require_account(account_id).await?;
        Ok(self.repo.list_transactions_for_account(account_id).await?)
    }

    /// Rows written to undo a transaction, if it was reversed.
    pub async fn reversals_of(
        &self,
        transaction_id: TransactionId,
    ) -> Result<Vec<Transaction>, LedgerError> {
        Ok(self.repo.list_reversals_of(transaction_id).await?)
    }

    /// Statement of an account over `[from, to]`.
    pub async fn statement(
        &self,
        account_id: AccountId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Statement, LedgerError> {
        let (account, rows) = self
            .repo
            .statement_snapshot(account_id, from)
            .await?
            .ok_or_else(|| LedgerError::account_not_found(account_id))?;
        Ok(build_statement(account_id, from, to, account.balance, &rows))
    }

    async fn require_account(&self, account_id: AccountId) -> Result<Account, LedgerError> {
        self.repo
            .get_account(account_id)
            .await?
            .ok_or_else(|| LedgerError::account_not_found(account_id))
    }

    /// Take the locks of `ids` within the configured timeout.
    pub(crate) async fn lock_accounts(&self, ids: &[AccountId]) -> Result<LockSet, LedgerError> {
        debug!(accounts = ?ids, "acquiring account locks");
        self.locks.acquire(ids, self.config.lock_timeout).await
    }
}

fn validate_amount(amount: Cents) -> Result<(), LedgerError> {
    if amount <= 0 {
        return Err(LedgerError::InvalidAmount(format!(
            "{} (must be positive)",
            format_cents(amount)
        )));
    }
    Ok(())
}

fn balance_overflow(account_id: AccountId) -> LedgerError {
    LedgerError::InvariantViolation(format!("balance of account #{} would overflow", account_id))
}

/// Explain why a credit matched no row.
async fn credit_failure(conn: &mut SqliteConnection, account_id: AccountId) -> LedgerError {
    match Repository::find_account(conn, account_id).await {
        Ok(None) => LedgerError::account_not_found(account_id),
        Ok(Some(_)) => balance_overflow(account_id),
        Err(e) => e.into(),
    }
}

async fn debit_for_reversal(
    conn: &mut SqliteConnection,
    account_id: AccountId,
    amount: Cents,
) -> Result<Account, LedgerError> {
    match Repository::debit(conn, account_id, amount).await? {
        Some(account) => Ok(account),
        None => Err(match Repository::find_account(conn, account_id).await? {
            None => LedgerError::InvariantViolation(format!(
                "account #{} of a live transaction is missing",
                account_id
            )),
            Some(account) => LedgerError::InsufficientBalanceForReversal {
                account_number: account.account_number,
                balance: account.balance,
                required: amount,
            },
        }),
    }
}
