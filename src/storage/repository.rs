use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Row, Sqlite, SqliteConnection, SqlitePool};

use crate::config::LedgerConfig;
use crate::domain::{
    Account, AccountId, AccountType, Cents, Dispute, DisputeId, DisputeStatus, LegDirection,
    OwnerId, Transaction, TransactionId, TransactionKind,
};

use super::MIGRATION_001_INITIAL;

/// An open database transaction. Every ledger mutation runs inside exactly one
/// and ends with an explicit commit or rollback.
pub type Unit = sqlx::Transaction<'static, Sqlite>;

const ACCOUNT_COLUMNS: &str = "id, owner_id, account_number, balance, account_type, created_at";

const TRANSACTION_COLUMNS: &str = "transaction_id, account_id, target_account_id, type, direction, amount, description, date, original_transaction_id, counterpart_id, reversed";

const DISPUTE_COLUMNS: &str =
    "id, transaction_id, user_id, reason, status, created_at, updated_at";

/// A single-account ledger row about to be written.
#[derive(Debug, Clone)]
pub struct NewEntry<'a> {
    pub account_id: AccountId,
    pub kind: TransactionKind,
    pub amount: Cents,
    pub description: &'a str,
    pub date: DateTime<Utc>,
    pub original_transaction_id: Option<TransactionId>,
    pub reversed: bool,
}

/// Both legs of a transfer about to be written.
#[derive(Debug, Clone)]
pub struct NewTransfer<'a> {
    pub from: AccountId,
    pub to: AccountId,
    pub amount: Cents,
    pub sent_description: &'a str,
    pub received_description: &'a str,
    pub date: DateTime<Utc>,
    pub original_transaction_id: Option<TransactionId>,
    pub reversed: bool,
}

/// Returns true if a storage error came from a UNIQUE constraint.
pub fn is_unique_violation(err: &anyhow::Error) -> bool {
    err.downcast_ref::<sqlx::Error>()
        .and_then(|e| e.as_database_error())
        .is_some_and(|e| e.is_unique_violation())
}

/// Repository for persisting and querying accounts, ledger rows and disputes.
///
/// Methods taking `&self` run on the pool and are safe outside a unit.
/// Associated functions taking a `SqliteConnection` run inside a [`Unit`]
/// opened with [`Repository::begin`].
#[derive(Clone)]
pub struct Repository {
    pool: SqlitePool,
}

impl Repository {
    /// Create a new repository with the given SQLite connection pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to an existing database.
    pub async fn connect(config: &LedgerConfig) -> Result<Self> {
        Self::open(config, false).await
    }

    /// Initialize a database (create if missing + migrate).
    pub async fn init(config: &LedgerConfig) -> Result<Self> {
        let repo = Self::open(config, true).await?;
        repo.migrate().await?;
        Ok(repo)
    }

    async fn open(config: &LedgerConfig, create: bool) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&config.database_url)
            .with_context(|| format!("Invalid database URL: {}", config.database_url))?
            .create_if_missing(create)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(config.lock_timeout)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.lock_timeout)
            .connect_with(options)
            .await
            .context("Failed to connect to database")?;

        Ok(Self::new(pool))
    }

    /// Run database migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(MIGRATION_001_INITIAL)
            .execute(&self.pool)
            .await
            .context("Failed to run migration 001")?;
        Ok(())
    }

    /// Open a unit of work.
    pub async fn begin(&self) -> Result<Unit> {
        self.pool.begin().await.context("Failed to begin ledger unit")
    }

    /// Current time at the precision the database stores.
    pub fn timestamp() -> DateTime<Utc> {
        Utc::now().trunc_subsecs(6)
    }

    // ========================
    // Account operations
    // ========================

    /// Insert a new account. The UNIQUE constraint on `account_number` is the
    /// final word on duplicates; see [`is_unique_violation`].
    pub async fn insert_account(
        &self,
        owner_id: OwnerId,
        account_number: &str,
        balance: Cents,
        account_type: AccountType,
        created_at: DateTime<Utc>,
    ) -> Result<Account> {
        let sql = format!(
            r#"
            INSERT INTO accounts (owner_id, account_number, balance, account_type, created_at)
            VALUES (?, ?, ?, ?, ?)
            RETURNING {ACCOUNT_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(owner_id)
            .bind(account_number)
            .bind(balance)
            .bind(account_type.as_str())
            .bind(encode_ts(created_at))
            .fetch_one(&self.pool)
            .await
            .context("Failed to save account")?;

        Self::row_to_account(&row)
    }

    /// Get an account by ID.
    pub async fn get_account(&self, id: AccountId) -> Result<Option<Account>> {
        let sql = format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = ?");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch account")?;

        row.as_ref().map(Self::row_to_account).transpose()
    }

    /// Get an account by its account number.
    pub async fn get_account_by_number(&self, account_number: &str) -> Result<Option<Account>> {
        let sql = format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE account_number = ?");
        let row = sqlx::query(&sql)
            .bind(account_number)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch account by number")?;

        row.as_ref().map(Self::row_to_account).transpose()
    }

    /// List the accounts of one owner.
    pub async fn list_accounts_by_owner(&self, owner_id: OwnerId) -> Result<Vec<Account>> {
        let sql = format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE owner_id = ? ORDER BY id");
        let rows = sqlx::query(&sql)
            .bind(owner_id)
            .fetch_all(&self.pool)
            .await
            .context("Failed to list accounts for owner")?;

        rows.iter().map(Self::row_to_account).collect()
    }

    /// List all accounts.
    pub async fn list_accounts(&self) -> Result<Vec<Account>> {
        let sql = format!("SELECT {ACCOUNT_COLUMNS} FROM accounts ORDER BY id");
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .context("Failed to list accounts")?;

        rows.iter().map(Self::row_to_account).collect()
    }

    // ========================
    // Ledger row queries
    // ========================

    /// Get a ledger row by ID.
    pub async fn get_transaction(&self, id: TransactionId) -> Result<Option<Transaction>> {
        let sql =
            format!("SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE transaction_id = ?");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch transaction")?;

        row.as_ref().map(Self::row_to_transaction).transpose()
    }

    /// All rows explaining one account's balance, oldest first.
    pub async fn list_transactions_for_account(
        &self,
        account_id: AccountId,
    ) -> Result<Vec<Transaction>> {
        let sql = format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE account_id = ? ORDER BY transaction_id"
        );
        let rows = sqlx::query(&sql)
            .bind(account_id)
            .fetch_all(&self.pool)
            .await
            .context("Failed to list transactions for account")?;

        rows.iter().map(Self::row_to_transaction).collect()
    }

    /// An account together with its rows dated at or after `from`, read from
    /// one snapshot so the balance and the rows agree.
    pub async fn statement_snapshot(
        &self,
        account_id: AccountId,
        from: DateTime<Utc>,
    ) -> Result<Option<(Account, Vec<Transaction>)>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to begin statement read")?;

        let Some(account) = Self::find_account(&mut tx, account_id).await? else {
            tx.rollback().await.context("Failed to end statement read")?;
            return Ok(None);
        };

        let sql = format!(
            r#"
            SELECT {TRANSACTION_COLUMNS}
            FROM transactions
            WHERE account_id = ? AND date >= ?
            ORDER BY date, transaction_id
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(account_id)
            .bind(encode_ts(from))
            .fetch_all(&mut *tx)
            .await
            .context("Failed to list statement transactions")?;
        tx.rollback().await.context("Failed to end statement read")?;

        let transactions = rows
            .iter()
            .map(Self::row_to_transaction)
            .collect::<Result<Vec<_>>>()?;
        Ok(Some((account, transactions)))
    }

    /// Compensating rows written for a reversed transaction.
    pub async fn list_reversals_of(&self, id: TransactionId) -> Result<Vec<Transaction>> {
        let sql = format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE original_transaction_id = ? ORDER BY transaction_id"
        );
        let rows = sqlx::query(&sql)
            .bind(id)
            .fetch_all(&self.pool)
            .await
            .context("Failed to list reversals")?;

        rows.iter().map(Self::row_to_transaction).collect()
    }

    // ========================
    // Dispute operations
    // ========================

    /// Open a pending dispute against a transaction that exists and is not
    /// reversed. Returns `None` if no such transaction exists; a second
    /// pending dispute for the same transaction fails with a UNIQUE violation.
    pub async fn insert_dispute_for(
        &self,
        user_id: OwnerId,
        transaction_id: TransactionId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Dispute>> {
        let sql = format!(
            r#"
            INSERT INTO disputes (transaction_id, user_id, reason, status, created_at, updated_at)
            SELECT transaction_id, ?, ?, 'pending', ?, ?
            FROM transactions
            WHERE transaction_id = ? AND reversed = 0
            RETURNING {DISPUTE_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(user_id)
            .bind(reason)
            .bind(encode_ts(now))
            .bind(encode_ts(now))
            .bind(transaction_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to save dispute")?;

        row.as_ref().map(Self::row_to_dispute).transpose()
    }

    /// Get a dispute by ID.
    pub async fn get_dispute(&self, id: DisputeId) -> Result<Option<Dispute>> {
        let sql = format!("SELECT {DISPUTE_COLUMNS} FROM disputes WHERE id = ?");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch dispute")?;

        row.as_ref().map(Self::row_to_dispute).transpose()
    }

    /// List disputes, newest first, optionally filtered by status.
    pub async fn list_disputes(&self, status: Option<DisputeStatus>) -> Result<Vec<Dispute>> {
        let rows = match status {
            Some(status) => {
                let sql = format!(
                    "SELECT {DISPUTE_COLUMNS} FROM disputes WHERE status = ? ORDER BY id DESC"
                );
                sqlx::query(&sql)
                    .bind(status.as_str())
                    .fetch_all(&self.pool)
                    .await
            }
            None => {
                let sql = format!("SELECT {DISPUTE_COLUMNS} FROM disputes ORDER BY id DESC");
                sqlx::query(&sql).fetch_all(&self.pool).await
            }
        }
        .context("Failed to list disputes")?;

        rows.iter().map(Self::row_to_dispute).collect()
    }

    /// Transactions of an account that are under a pending or approved dispute.
    pub async fn active_disputed_transactions(
        &self,
        account_id: AccountId,
    ) -> Result<Vec<TransactionId>> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT d.transaction_id
            FROM disputes d
            JOIN transactions t ON t.transaction_id = d.transaction_id
            WHERE t.account_id = ? AND d.status IN ('pending', 'approved')
            ORDER BY d.transaction_id
            "#,
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list disputed transactions")?;

        Ok(rows.iter().map(|r| r.get("transaction_id")).collect())
    }

    // ========================
    // Unit-scoped statements
    // ========================

    /// Read an account inside a unit.
    pub async fn find_account(
        conn: &mut SqliteConnection,
        id: AccountId,
    ) -> Result<Option<Account>> {
        let sql = format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = ?");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&mut *conn)
            .await
            .context("Failed to fetch account")?;

        row.as_ref().map(Self::row_to_account).transpose()
    }

    /// Add `amount` to a balance. Returns `None` if the account does not exist
    /// or the new balance would not fit in [`Cents`].
    pub async fn credit(
        conn: &mut SqliteConnection,
        id: AccountId,
        amount: Cents,
    ) -> Result<Option<Account>> {
        let sql = format!(
            "UPDATE accounts SET balance = balance + ? WHERE id = ? AND balance <= ? RETURNING {ACCOUNT_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(amount)
            .bind(id)
            .bind(Cents::MAX - amount)
            .fetch_optional(&mut *conn)
            .await
            .context("Failed to credit account")?;

        row.as_ref().map(Self::row_to_account).transpose()
    }

    /// Subtract `amount` from a balance if it holds at least that much.
    /// Returns `None` if the account does not exist or is short of funds;
    /// the check and the write are one statement.
    pub async fn debit(
        conn: &mut SqliteConnection,
        id: AccountId,
        amount: Cents,
    ) -> Result<Option<Account>> {
        let sql = format!(
            "UPDATE accounts SET balance = balance - ? WHERE id = ? AND balance >= ? RETURNING {ACCOUNT_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(amount)
            .bind(id)
            .bind(amount)
            .fetch_optional(&mut *conn)
            .await
            .context("Failed to debit account")?;

        row.as_ref().map(Self::row_to_account).transpose()
    }

    /// Append a deposit or withdraw row.
    pub async fn insert_entry(
        conn: &mut SqliteConnection,
        entry: &NewEntry<'_>,
    ) -> Result<Transaction> {
        let sql = format!(
            r#"
            INSERT INTO transactions (account_id, type, amount, description, date, original_transaction_id, reversed)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            RETURNING {TRANSACTION_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(entry.account_id)
            .bind(entry.kind.as_str())
            .bind(entry.amount)
            .bind(entry.description)
            .bind(encode_ts(entry.date))
            .bind(entry.original_transaction_id)
            .bind(entry.reversed)
            .fetch_one(&mut *conn)
            .await
            .context("Failed to save transaction")?;

        Self::row_to_transaction(&row)
    }

    /// Append both legs of a transfer, linked to each other.
    /// Returns `(sender leg, receiver leg)`.
    pub async fn insert_transfer_legs(
        conn: &mut SqliteConnection,
        transfer: &NewTransfer<'_>,
    ) -> Result<(Transaction, Transaction)> {
        let sql = format!(
            r#"
            INSERT INTO transactions (account_id, target_account_id, type, direction, amount, description, date, original_transaction_id, counterpart_id, reversed)
            VALUES (?, ?, 'transfer', ?, ?, ?, ?, ?, ?, ?)
            RETURNING {TRANSACTION_COLUMNS}
            "#
        );
        let date = encode_ts(transfer.date);

        let sent_row = sqlx::query(&sql)
            .bind(transfer.from)
            .bind(transfer.to)
            .bind(LegDirection::Outgoing.as_str())
            .bind(transfer.amount)
            .bind(transfer.sent_description)
            .bind(&date)
            .bind(transfer.original_transaction_id)
            .bind(None::<TransactionId>)
            .bind(transfer.reversed)
            .fetch_one(&mut *conn)
            .await
            .context("Failed to save sender leg")?;
        let mut sent = Self::row_to_transaction(&sent_row)?;

        let received_row = sqlx::query(&sql)
            .bind(transfer.to)
            .bind(transfer.from)
            .bind(LegDirection::Incoming.as_str())
            .bind(transfer.amount)
            .bind(transfer.received_description)
            .bind(&date)
            .bind(transfer.original_transaction_id)
            .bind(sent.transaction_id)
            .bind(transfer.reversed)
            .fetch_one(&mut *conn)
            .await
            .context("Failed to save receiver leg")?;
        let received = Self::row_to_transaction(&received_row)?;

        sqlx::query("UPDATE transactions SET counterpart_id = ? WHERE transaction_id = ?")
            .bind(received.transaction_id)
            .bind(sent.transaction_id)
            .execute(&mut *conn)
            .await
            .context("Failed to link transfer legs")?;
        sent.counterpart_id = Some(received.transaction_id);

        Ok((sent, received))
    }

    /// Read a ledger row inside a unit.
    pub async fn find_transaction(
        conn: &mut SqliteConnection,
        id: TransactionId,
    ) -> Result<Option<Transaction>> {
        let sql =
            format!("SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE transaction_id = ?");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&mut *conn)
            .await
            .context("Failed to fetch transaction")?;

        row.as_ref().map(Self::row_to_transaction).transpose()
    }

    /// Flip `reversed` from false to true. Returns the row (now reversed) only
    /// if this call did the flip, so at most one caller ever wins.
    pub async fn claim_for_reversal(
        conn: &mut SqliteConnection,
        id: TransactionId,
    ) -> Result<Option<Transaction>> {
        let sql = format!(
            "UPDATE transactions SET reversed = 1 WHERE transaction_id = ? AND reversed = 0 RETURNING {TRANSACTION_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&mut *conn)
            .await
            .context("Failed to mark transaction reversed")?;

        row.as_ref().map(Self::row_to_transaction).transpose()
    }

    /// Read a dispute inside a unit.
    pub async fn find_dispute(
        conn: &mut SqliteConnection,
        id: DisputeId,
    ) -> Result<Option<Dispute>> {
        let sql = format!("SELECT {DISPUTE_COLUMNS} FROM disputes WHERE id = ?");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&mut *conn)
            .await
            .context("Failed to fetch dispute")?;

        row.as_ref().map(Self::row_to_dispute).transpose()
    }

    /// Move a dispute out of `pending`. Returns `None` if it was not pending.
    pub async fn resolve_dispute(
        conn: &mut SqliteConnection,
        id: DisputeId,
        status: DisputeStatus,
        now: DateTime<Utc>,
    ) -> Result<Option<Dispute>> {
        let sql = format!(
            "UPDATE disputes SET status = ?, updated_at = ? WHERE id = ? AND status = 'pending' RETURNING {DISPUTE_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(status.as_str())
            .bind(encode_ts(now))
            .bind(id)
            .fetch_optional(&mut *conn)
            .await
            .context("Failed to update dispute status")?;

        row.as_ref().map(Self::row_to_dispute).transpose()
    }

    /// Delete every ledger row referencing the account, then the account.
    /// Returns the number of ledger rows removed, or `None` if the account
    /// did not exist.
    pub async fn delete_account_cascade(
        conn: &mut SqliteConnection,
        id: AccountId,
    ) -> Result<Option<u64>> {
        let purged = sqlx::query(
            "DELETE FROM transactions WHERE account_id = ? OR target_account_id = ?",
        )
        .bind(id)
        .bind(id)
        .execute(&mut *conn)
        .await
        .context("Failed to delete account transactions")?
        .rows_affected();

        let deleted = sqlx::query("DELETE FROM accounts WHERE id = ?")
            .bind(id)
            .execute(&mut *conn)
            .await
            .context("Failed to delete account")?
            .rows_affected();

        Ok((deleted > 0).then_some(purged))
    }

    // ========================
    // Row mapping
    // ========================

    fn row_to_account(row: &SqliteRow) -> Result<Account> {
        let account_type_str: String = row.get("account_type");
        let created_at_str: String = row.get("created_at");

        Ok(Account {
            id: row.get("id"),
            owner_id: row.get("owner_id"),
            account_number: row.get("account_number"),
            balance: row.get("balance"),
            account_type: AccountType::from_str(&account_type_str)
                .ok_or_else(|| anyhow::anyhow!("Invalid account type: {}", account_type_str))?,
            created_at: decode_ts(&created_at_str).context("Invalid created_at timestamp")?,
        })
    }

    fn row_to_transaction(row: &SqliteRow) -> Result<Transaction> {
        let type_str: String = row.get("type");
        let direction_str: Option<String> = row.get("direction");
        let date_str: String = row.get("date");

        Ok(Transaction {
            transaction_id: row.get("transaction_id"),
            account_id: row.get("account_id"),
            target_account_id: row.get("target_account_id"),
            kind: TransactionKind::from_parts(&type_str, direction_str.as_deref()).ok_or_else(
                || anyhow::anyhow!("Invalid transaction type: {} {:?}", type_str, direction_str),
            )?,
            amount: row.get("amount"),
            description: row.get("description"),
            date: decode_ts(&date_str).context("Invalid transaction date")?,
            original_transaction_id: row.get("original_transaction_id"),
            counterpart_id: row.get("counterpart_id"),
            reversed: row.get::<i64, _>("reversed") != 0,
        })
    }

    fn row_to_dispute(row: &SqliteRow) -> Result<Dispute> {
        let status_str: String = row.get("status");
        let created_at_str: String = row.get("created_at");
        let updated_at_str: String = row.get("updated_at");

        Ok(Dispute {
            id: row.get("id"),
            transaction_id: row.get("transaction_id"),
            user_id: row.get("user_id"),
            reason: row.get("reason"),
            status: DisputeStatus::from_str(&status_str)
                .ok_or_else(|| anyhow::anyhow!("Invalid dispute status: {}", status_str))?,
            created_at: decode_ts(&created_at_str).context("Invalid created_at timestamp")?,
            updated_at: decode_ts(&updated_at_str).context("Invalid updated_at timestamp")?,
        })
    }
}

/// Fixed-width UTC timestamps so that text order is time order.
fn encode_ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn decode_ts(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)?.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn test_timestamps_sort_as_text() {
        let early = Utc.with_ymd_and_hms(2024, 1, 5, 9, 0, 0).unwrap();
        let late = early + chrono::Duration::microseconds(1500);

        assert!(encode_ts(early) < encode_ts(late));
        assert_eq!(encode_ts(early), "2024-01-05T09:00:00.000000Z");
        assert_eq!(decode_ts(&encode_ts(late)).unwrap(), late);
    }

    #[test]
    fn test_timestamp_round_trips_exactly() {
        let now = Repository::timestamp();
        assert_eq!(decode_ts(&encode_ts(now)).unwrap(), now);
    }
}
