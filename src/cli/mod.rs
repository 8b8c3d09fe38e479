use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand};

use crate::application::{LedgerService, LogSink, OpenDirectory};
use crate::config::LedgerConfig;
use crate::domain::{
    Account, AccountType, DisputeStatus, Transaction, format_cents, parse_cents,
};

/// Strongroom - banking ledger administration
#[derive(Parser)]
#[command(name = "strongroom")]
#[command(about = "Accounts, postings, transfers and disputes over a SQLite ledger")]
#[command(version)]
pub struct Cli {
    /// Database file path (overrides LEDGER_DATABASE_URL)
    #[arg(short, long)]
    pub database: Option<String>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize a new database
    Init,

    /// Account management commands
    #[command(subcommand)]
    Account(AccountCommands),

    /// Deposit money into an account
    Deposit {
        /// Account ID or account number
        account: String,

        /// Amount (e.g., "50.00" or "50")
        amount: String,
    },

    /// Withdraw money from an account
    Withdraw {
        /// Account ID or account number
        account: String,

        /// Amount (e.g., "50.00" or "50")
        amount: String,
    },

    /// Transfer money between accounts
    Transfer {
        /// Amount to transfer (e.g., "50.00" or "50")
        amount: String,

        /// Source account ID or account number
        #[arg(long)]
        from: String,

        /// Destination account number
        #[arg(long)]
        to: String,
    },

    /// Reverse a transaction (either leg of a transfer reverses both)
    Reverse {
        /// Transaction ID
        id: i64,
    },

    /// Show detailed transaction information
    #[command(name = "show")]
    ShowTransaction {
        /// Transaction ID
        id: i64,
    },

    /// Dispute commands
    #[command(subcommand)]
    Dispute(DisputeCommands),

    /// Statement of an account over a date range
    Statement {
        /// Account ID or account number
        account: String,

        /// First day (YYYY-MM-DD)
        #[arg(long)]
        from: String,

        /// Last day, inclusive (YYYY-MM-DD)
        #[arg(long)]
        to: String,
    },

    /// Full transaction history of an account
    History {
        /// Account ID or account number
        account: String,
    },
}

#[derive(Subcommand)]
pub enum AccountCommands {
    /// Open a new account
    Create {
        /// Owner (user) ID
        #[arg(long)]
        owner: i64,

        /// Account number, e.g. ACC001
        #[arg(long)]
        number: String,

        /// Account type: saving, current
        #[arg(short = 't', long = "type", default_value = "saving")]
        account_type: String,

        /// Opening balance
        #[arg(short, long, default_value = "0")]
        balance: String,
    },

    /// Show an account
    Show {
        /// Account ID or account number
        account: String,
    },

    /// List accounts
    List {
        /// Only accounts of this owner
        #[arg(long)]
        owner: Option<i64>,
    },

    /// Delete an account and every transaction that references it
    Delete {
        /// Account ID or account number
        account: String,
    },

    /// Delete every account of an owner
    DeleteOwner {
        /// Owner (user) ID
        owner: i64,
    },
}

#[derive(Subcommand)]
pub enum DisputeCommands {
    /// Contest a transaction
    Raise {
        /// Transaction ID
        transaction: i64,

        /// User raising the dispute
        #[arg(long)]
        user: i64,

        /// Why the transaction is contested
        #[arg(short, long)]
        reason: String,
    },

    /// Approve (reverse the transaction) or reject a pending dispute
    Review {
        /// Dispute ID
        id: i64,

        #[arg(long, conflicts_with = "reject", required_unless_present = "reject")]
        approve: bool,

        #[arg(long)]
        reject: bool,
    },

    /// List disputes
    List {
        /// Filter by status: pending, approved, rejected
        #[arg(long)]
        status: Option<String>,
    },

    /// Show a dispute
    Show {
        /// Dispute ID
        id: i64,
    },
}

impl Cli {
    fn config(&self) -> LedgerConfig {
        let config = LedgerConfig::from_env();
        match &self.database {
            Some(path) => config.with_database_path(path),
            None => config,
        }
    }

    pub async fn run(self) -> Result<()> {
        let config = self.config();
        let url = config.database_url.clone();
        let directory = Arc::new(OpenDirectory);
        let sink = Arc::new(LogSink);

        let service = if matches!(self.command, Commands::Init) {
            LedgerService::init(config, directory, sink).await?
        } else {
            LedgerService::connect(config, directory, sink).await?
        };

        let result = run_command(&service, self.command, &url).await;
        service.drain_notifications().await;
        result
    }
}

async fn run_command(service: &LedgerService, command: Commands, url: &str) -> Result<()> {
    match command {
        Commands::Init => println!("Database initialized: {}", url),

        Commands::Account(cmd) => run_account_command(service, cmd).await?,

        Commands::Deposit { account, amount } => {
            let account = resolve_account(service, &account).await?;
            let amount = parse_amount(&amount)?;
            let posting = service.ledger().deposit(account.id, amount).await?;
            println!(
                "Deposited {} into {} (transaction #{}). Balance: {}",
                format_cents(amount),
                posting.account.account_number,
                posting.transaction.transaction_id,
                format_cents(posting.balance())
            );
        }

        Commands::Withdraw { account, amount } => {
            let account = resolve_account(service, &account).await?;
            let amount = parse_amount(&amount)?;
            let posting = service.ledger().withdraw(account.id, amount).await?;
            println!(
                "Withdrew {} from {} (transaction #{}). Balance: {}",
                format_cents(amount),
                posting.account.account_number,
                posting.transaction.transaction_id,
                format_cents(posting.balance())
            );
        }

        Commands::Transfer { amount, from, to } => {
            let from = resolve_account(service, &from).await?;
            let amount = parse_amount(&amount)?;
            let receipt = service.ledger().transfer(from.id, &to, amount).await?;
            println!(
                "Transferred {} {} -> {} (transactions #{} / #{})",
                format_cents(amount),
                receipt.from.account_number,
                receipt.to.account_number,
                receipt.sent.transaction_id,
                receipt.received.transaction_id
            );
        }

        Commands::Reverse { id } => {
            let reversal = service.ledger().reverse_transaction(id).await?;
            println!(
                "Reversed transaction #{} ({} {})",
                reversal.original.transaction_id,
                reversal.original.kind,
                format_cents(reversal.original.amount)
            );
            if let Some(counterpart) = &reversal.counterpart {
                println!("  Counterpart leg:  #{}", counterpart.transaction_id);
            }
            for row in &reversal.compensating {
                println!(
                    "  Compensating:     #{} {} {}",
                    row.transaction_id,
                    row.kind,
                    format_cents(row.amount)
                );
            }
            for account in &reversal.accounts {
                println!(
                    "  Balance {:<9} {}",
                    account.account_number,
                    format_cents(account.balance)
                );
            }
        }

        Commands::ShowTransaction { id } => run_show_transaction_command(service, id).await?,

        Commands::Dispute(cmd) => run_dispute_command(service, cmd).await?,

        Commands::Statement { account, from, to } => {
            let account = resolve_account(service, &account).await?;
            let from = parse_date(&from)
                .with_context(|| format!("Invalid date format '{}'. Use YYYY-MM-DD", from))?;
            let to = end_of_day(&to)
                .with_context(|| format!("Invalid date format '{}'. Use YYYY-MM-DD", to))?;

            let statement = service.ledger().statement(account.id, from, to).await?;

            println!(
                "Statement for {} ({} to {})",
                account.account_number,
                statement.from.format("%Y-%m-%d"),
                statement.to.format("%Y-%m-%d")
            );
            println!();
            if statement.lines.is_empty() {
                println!("No transactions in this period.");
            } else {
                println!(
                    "{:<8} {:<12} {:<14} {:>12} {:>12}  {}",
                    "ID", "DATE", "TYPE", "AMOUNT", "BALANCE", "DESCRIPTION"
                );
                println!("{}", "-".repeat(88));
                for line in &statement.lines {
                    let t = &line.transaction;
                    println!(
                        "{:<8} {:<12} {:<14} {:>12} {:>12}  {}",
                        t.transaction_id,
                        t.date.format("%Y-%m-%d"),
                        t.kind.to_string(),
                        format_cents(line.delta),
                        format_cents(line.balance),
                        truncate(&t.description, 36)
                    );
                }
            }
            println!();
            println!("  Opening:    {}", format_cents(statement.opening_balance));
            println!("  Credits:    {}", format_cents(statement.total_credits));
            println!("  Debits:     {}", format_cents(statement.total_debits));
            println!("  Net change: {}", format_cents(statement.net_change()));
            println!("  Closing:    {}", format_cents(statement.closing_balance));
        }

        Commands::History { account } => {
            let account = resolve_account(service, &account).await?;
            let rows = service.ledger().transactions_for(account.id).await?;
            print_transactions(&rows);
        }
    }
    Ok(())
}

async fn run_account_command(service: &LedgerService, cmd: AccountCommands) -> Result<()> {
    match cmd {
        AccountCommands::Create {
            owner,
            number,
            account_type,
            balance,
        } => {
            let at = AccountType::from_str(&account_type).ok_or_else(|| {
                anyhow::anyhow!(
                    "Invalid account type '{}'. Valid types: saving, current",
                    account_type
                )
            })?;
            let balance = parse_cents(&balance)
                .map_err(|e| anyhow::anyhow!("Invalid opening balance '{}': {}", balance, e))?;

            let account = service.accounts().create(owner, &number, balance, at).await?;
            println!(
                "Created account: {} (#{}, {})",
                account.account_number, account.id, account.account_type
            );
        }

        AccountCommands::Show { account } => {
            let account = resolve_account(service, &account).await?;
            let disputed = service
                .disputes()
                .active_disputes_for_account(account.id)
                .await?;

            println!("Account: {}", account.account_number);
            println!("  ID:       {}", account.id);
            println!("  Owner:    {}", account.owner_id);
            println!("  Type:     {}", account.account_type);
            println!("  Balance:  {}", format_cents(account.balance));
            println!(
                "  Created:  {}",
                account.created_at.format("%Y-%m-%d %H:%M:%S")
            );
            if !disputed.is_empty() {
                let ids: Vec<String> = disputed.iter().map(|id| format!("#{}", id)).collect();
                println!("  Disputed: {}", ids.join(", "));
            }
        }

        AccountCommands::List { owner } => {
            let accounts = match owner {
                Some(owner) => service.accounts().list_by_owner(owner).await?,
                None => service.accounts().list().await?,
            };
            print_accounts(&accounts);
        }

        AccountCommands::Delete { account } => {
            let account = resolve_account(service, &account).await?;
            let purged = service.accounts().delete(account.id).await?;
            println!(
                "Deleted account {} and {} transaction(s)",
                account.account_number, purged
            );
        }

        AccountCommands::DeleteOwner { owner } => {
            let deleted = service.accounts().delete_by_owner(owner).await?;
            if deleted.is_empty() {
                println!("No accounts found for owner {}", owner);
            }
            for (account, purged) in &deleted {
                println!(
                    "Deleted account {} and {} transaction(s)",
                    account.account_number, purged
                );
            }
        }
    }
    Ok(())
}

async fn run_dispute_command(service: &LedgerService, cmd: DisputeCommands) -> Result<()> {
    match cmd {
        DisputeCommands::Raise {
            transaction,
            user,
            reason,
        } => {
            let dispute = service
                .disputes()
                .raise_dispute(user, transaction, &reason)
                .await?;
            println!(
                "Raised dispute #{} on transaction #{}",
                dispute.id, dispute.transaction_id
            );
        }

        DisputeCommands::Review {
            id,
            approve,
            reject: _,
        } => {
            let review = service.disputes().review_dispute(id, approve).await?;
            println!("Dispute #{} {}", review.dispute.id, review.dispute.status);
            if let Some(reversal) = &review.reversal {
                let ids: Vec<String> = reversal
                    .compensating
                    .iter()
                    .map(|t| format!("#{}", t.transaction_id))
                    .collect();
                println!(
                    "  Reversed transaction #{} with {}",
                    reversal.original.transaction_id,
                    ids.join(", ")
                );
            }
        }

        DisputeCommands::List { status } => {
            let status = status
                .map(|s| {
                    DisputeStatus::from_str(&s).ok_or_else(|| {
                        anyhow::anyhow!(
                            "Invalid status '{}'. Valid: pending, approved, rejected",
                            s
                        )
                    })
                })
                .transpose()?;

            let disputes = service.disputes().list_disputes(status).await?;
            if disputes.is_empty() {
                println!("No disputes found.");
            } else {
                println!(
                    "{:<6} {:<12} {:<8} {:<10} {:<12}  {}",
                    "ID", "TRANSACTION", "USER", "STATUS", "RAISED", "REASON"
                );
                println!("{}", "-".repeat(76));
                for d in disputes {
                    println!(
                        "{:<6} {:<12} {:<8} {:<10} {:<12}  {}",
                        d.id,
                        d.transaction_id,
                        d.user_id,
                        d.status.as_str(),
                        d.created_at.format("%Y-%m-%d"),
                        truncate(&d.reason, 30)
                    );
                }
            }
        }

        DisputeCommands::Show { id } => {
            let dispute = service.disputes().get_dispute(id).await?;
            println!("Dispute: #{}", dispute.id);
            println!("  Transaction: #{}", dispute.transaction_id);
            println!("  User:        {}", dispute.user_id);
            println!("  Status:      {}", dispute.status);
            println!("  Reason:      {}", dispute.reason);
            println!(
                "  Raised:      {}",
                dispute.created_at.format("%Y-%m-%d %H:%M:%S")
            );
            println!(
                "  Updated:     {}",
                dispute.updated_at.format("%Y-%m-%d %H:%M:%S")
            );
        }
    }
    Ok(())
}

async fn run_show_transaction_command(service: &LedgerService, id: i64) -> Result<()> {
    let t = service.ledger().get_transaction(id).await?;

    println!("Transaction: #{}", t.transaction_id);
    println!("  Date:        {}", t.date.format("%Y-%m-%d %H:%M:%S"));
    println!("  Type:        {}", t.kind);
    println!("  Amount:      {}", format_cents(t.amount));
    println!("  Account:     #{}", t.account_id);
    if let Some(target) = t.target_account_id {
        println!("  Counterparty: #{}", target);
    }
    if let Some(counterpart) = t.counterpart_id {
        println!("  Other leg:   #{}", counterpart);
    }
    println!("  Description: {}", t.description);
    println!("  Reversed:    {}", if t.reversed { "yes" } else { "no" });

    if let Some(original) = t.original_transaction_id {
        println!();
        println!("  This is a reversal of: #{}", original);
    } else if t.reversed {
        let reversals = service.ledger().reversals_of(t.transaction_id).await?;
        if !reversals.is_empty() {
            println!();
            println!("  Reversed by:");
            for rev in &reversals {
                println!(
                    "    - #{} {} {} on {}",
                    rev.transaction_id,
                    rev.kind,
                    format_cents(rev.amount),
                    rev.date.format("%Y-%m-%d")
                );
            }
        }
    }

    Ok(())
}

fn print_accounts(accounts: &[Account]) {
    if accounts.is_empty() {
        println!("No accounts found.");
        return;
    }
    println!(
        "{:<6} {:<16} {:<8} {:<10} {:>14}",
        "ID", "NUMBER", "OWNER", "TYPE", "BALANCE"
    );
    println!("{}", "-".repeat(58));
    for a in accounts {
        println!(
            "{:<6} {:<16} {:<8} {:<10} {:>14}",
            a.id,
            a.account_number,
            a.owner_id,
            a.account_type.as_str(),
            format_cents(a.balance)
        );
    }
}

fn print_transactions(rows: &[Transaction]) {
    if rows.is_empty() {
        println!("No transactions found.");
        return;
    }
    println!(
        "{:<8} {:<17} {:<14} {:>12} {:<4}  {}",
        "ID", "DATE", "TYPE", "AMOUNT", "REV", "DESCRIPTION"
    );
    println!("{}", "-".repeat(80));
    for t in rows {
        println!(
            "{:<8} {:<17} {:<14} {:>12} {:<4}  {}",
            t.transaction_id,
            t.date.format("%Y-%m-%d %H:%M"),
            t.kind.to_string(),
            format_cents(t.signed_delta()),
            reversal_mark(t),
            truncate(&t.description, 30)
        );
    }
}

/// `undo` marks a compensating row, `yes` a row that was reversed.
fn reversal_mark(t: &Transaction) -> &'static str {
    if t.is_reversal() {
        "undo"
    } else if t.reversed {
        "yes"
    } else {
        ""
    }
}

/// Accept either a numeric account ID or an account number.
async fn resolve_account(service: &LedgerService, reference: &str) -> Result<Account> {
    let account = match reference.parse::<i64>() {
        Ok(id) => service.accounts().get(id).await?,
        Err(_) => service.accounts().get_by_number(reference).await?,
    };
    Ok(account)
}

fn parse_amount(input: &str) -> Result<i64> {
    parse_cents(input)
        .map_err(|e| anyhow::anyhow!("Invalid amount '{}': {}. Use '50.00' or '50'", input, e))
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len - 3).collect();
        format!("{}...", kept)
    }
}

fn parse_date(date_str: &str) -> Result<DateTime<Utc>> {
    let naive_date = NaiveDate::parse_from_str(date_str, "%Y-%m-%d")
        .context("Date must be in YYYY-MM-DD format")?;

    let naive_datetime = naive_date
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| anyhow::anyhow!("Invalid date"))?;

    Ok(DateTime::from_naive_utc_and_offset(naive_datetime, Utc))
}

/// Last representable instant of the given day.
fn end_of_day(date_str: &str) -> Result<DateTime<Utc>> {
    let naive_date = NaiveDate::parse_from_str(date_str, "%Y-%m-%d")
        .context("Date must be in YYYY-MM-DD format")?;

    let naive_datetime = naive_date
        .and_hms_micro_opt(23, 59, 59, 999_999)
        .ok_or_else(|| anyhow::anyhow!("Invalid date"))?;

    Ok(DateTime::from_naive_utc_and_offset(naive_datetime, Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_dates() {
        let from = parse_date("2024-03-01").unwrap();
        let to = end_of_day("2024-03-01").unwrap();
        assert!(from < to);
        assert_eq!(to.format("%H:%M:%S").to_string(), "23:59:59");
        assert!(parse_date("03/01/2024").is_err());
    }

    #[test]
    fn test_reversal_mark() {
        let mut row = Transaction {
            transaction_id: 4,
            account_id: 1,
            target_account_id: None,
            kind: crate::domain::TransactionKind::Deposit,
            amount: 500,
            description: "Deposit".to_string(),
            date: chrono::Utc::now(),
            original_transaction_id: None,
            counterpart_id: None,
            reversed: false,
        };
        assert_eq!(reversal_mark(&row), "");
        row.reversed = true;
        assert_eq!(reversal_mark(&row), "yes");
        row.original_transaction_id = Some(2);
        assert_eq!(reversal_mark(&row), "undo");
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("a much longer description", 10), "a much ...");
    }

    #[test]
    fn test_review_requires_a_decision() {
        assert!(Cli::try_parse_from(["strongroom", "dispute", "review", "3"]).is_err());
        assert!(
            Cli::try_parse_from(["strongroom", "dispute", "review", "3", "--approve", "--reject"])
                .is_err()
        );
        assert!(Cli::try_parse_from(["strongroom", "dispute", "review", "3", "--reject"]).is_ok());
    }
}
