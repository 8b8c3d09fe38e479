mod common;

use anyhow::Result;
use chrono::Duration;
use common::{ALICE, BOB, test_ledger};
use strongroom::application::{ErrorKind, LedgerError};
use strongroom::domain::{LegDirection, TransactionKind};

#[tokio::test]
async fn test_deposit_adds_one_row() -> Result<()> {
    let ledger = test_ledger().await?;
    let a = ledger.open(ALICE, "ACC001", 10000).await?;

    let posting = ledger.service.ledger().deposit(a.id, 5000).await?;

    assert_eq!(posting.balance(), 15000);
    assert_eq!(ledger.balance(&a).await?, 15000);
    assert_eq!(posting.transaction.kind, TransactionKind::Deposit);
    assert_eq!(posting.transaction.amount, 5000);
    assert!(!posting.transaction.reversed);

    let rows = ledger.service.ledger().transactions_for(a.id).await?;
    assert_eq!(rows, vec![posting.transaction]);
    Ok(())
}

#[tokio::test]
async fn test_withdraw_insufficient_balance_changes_nothing() -> Result<()> {
    let ledger = test_ledger().await?;
    let a = ledger.open(ALICE, "ACC001", 10000).await?;

    let err = ledger
        .service
        .ledger()
        .withdraw(a.id, 15000)
        .await
        .unwrap_err();

    match &err {
        LedgerError::InsufficientBalance {
            account_number,
            balance,
            required,
        } => {
            assert_eq!(account_number, "ACC001");
            assert_eq!(*balance, 10000);
            assert_eq!(*required, 15000);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(ledger.balance(&a).await?, 10000);
    assert!(ledger.service.ledger().transactions_for(a.id).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_withdraw_down_to_zero() -> Result<()> {
    let ledger = test_ledger().await?;
    let a = ledger.open(ALICE, "ACC001", 2500).await?;

    let posting = ledger.service.ledger().withdraw(a.id, 2500).await?;

    assert_eq!(posting.balance(), 0);
    assert_eq!(posting.transaction.kind, TransactionKind::Withdraw);
    Ok(())
}

#[tokio::test]
async fn test_amounts_must_be_positive() -> Result<()> {
    let ledger = test_ledger().await?;
    let a = ledger.open(ALICE, "ACC001", 10000).await?;
    ledger.open(BOB, "ACC002", 0).await?;
    let engine = ledger.service.ledger();

    for result in [
        engine.deposit(a.id, 0).await.map(|_| ()),
        engine.withdraw(a.id, -100).await.map(|_| ()),
        engine.transfer(a.id, "ACC002", 0).await.map(|_| ()),
    ] {
        let err = result.unwrap_err();
        assert!(matches!(err, LedgerError::InvalidAmount(_)));
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    assert_eq!(ledger.balance(&a).await?, 10000);
    Ok(())
}

#[tokio::test]
async fn test_unknown_account() -> Result<()> {
    let ledger = test_ledger().await?;
    ledger.open(BOB, "ACC002", 0).await?;

    assert!(matches!(
        ledger.service.ledger().deposit(99, 100).await,
        Err(LedgerError::AccountNotFound(_))
    ));
    assert!(matches!(
        ledger.service.ledger().withdraw(99, 100).await,
        Err(LedgerError::AccountNotFound(_))
    ));
    assert!(matches!(
        ledger.service.ledger().transfer(99, "ACC002", 100).await,
        Err(LedgerError::AccountNotFound(_))
    ));
    Ok(())
}

#[tokio::test]
async fn test_transfer_writes_linked_legs() -> Result<()> {
    let ledger = test_ledger().await?;
    let a = ledger.open(ALICE, "ACC001", 20000).await?;
    let b = ledger.open(BOB, "ACC002", 5000).await?;

    let receipt = ledger.service.ledger().transfer(a.id, "ACC002", 8000).await?;

    assert_eq!(receipt.from.balance, 12000);
    assert_eq!(receipt.to.balance, 13000);
    assert_eq!(ledger.balance(&a).await?, 12000);
    assert_eq!(ledger.balance(&b).await?, 13000);

    let sent = ledger
        .service
        .ledger()
        .get_transaction(receipt.sent.transaction_id)
        .await?;
    let received = ledger
        .service
        .ledger()
        .get_transaction(receipt.received.transaction_id)
        .await?;

    assert_eq!(sent.kind, TransactionKind::TransferLeg(LegDirection::Outgoing));
    assert_eq!(received.kind, TransactionKind::TransferLeg(LegDirection::Incoming));
    assert_eq!(sent.account_id, a.id);
    assert_eq!(sent.target_account_id, Some(b.id));
    assert_eq!(received.account_id, b.id);
    assert_eq!(received.target_account_id, Some(a.id));
    assert_eq!(sent.counterpart_id, Some(received.transaction_id));
    assert_eq!(received.counterpart_id, Some(sent.transaction_id));
    assert_eq!(sent.amount, received.amount);
    assert_eq!(sent.date, received.date);
    assert_eq!(sent, receipt.sent);
    assert_eq!(received, receipt.received);
    Ok(())
}

#[tokio::test]
async fn test_failed_transfers_leave_no_trace() -> Result<()> {
    let ledger = test_ledger().await?;
    let a = ledger.open(ALICE, "ACC001", 20000).await?;
    let b = ledger.open(BOB, "ACC002", 5000).await?;
    let engine = ledger.service.ledger();

    let err = engine.transfer(a.id, "ACC404", 100).await.unwrap_err();
    assert!(matches!(err, LedgerError::TargetNotFound(ref n) if n == "ACC404"));

    let err = engine.transfer(a.id, "ACC001", 100).await.unwrap_err();
    assert!(matches!(err, LedgerError::SameAccount(_)));
    assert_eq!(err.kind(), ErrorKind::Validation);

    let err = engine.transfer(a.id, "ACC002", 20001).await.unwrap_err();
    assert!(matches!(err, LedgerError::InsufficientBalance { .. }));

    assert_eq!(ledger.balance(&a).await?, 20000);
    assert_eq!(ledger.balance(&b).await?, 5000);
    assert!(engine.transactions_for(a.id).await?.is_empty());
    assert!(engine.transactions_for(b.id).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_conservation_across_mixed_operations() -> Result<()> {
    let ledger = test_ledger().await?;
    let a = ledger.open(ALICE, "ACC001", 10000).await?;
    let b = ledger.open(BOB, "ACC002", 10000).await?;
    let c = ledger.open(BOB, "ACC003", 0).await?;
    let engine = ledger.service.ledger();
    let before = ledger.total().await?;

    engine.deposit(a.id, 2500).await?;
    engine.withdraw(b.id, 4000).await?;
    engine.transfer(a.id, "ACC003", 7000).await?;
    engine.transfer(c.id, "ACC002", 3000).await?;
    // Rejected operations must not count
    let _ = engine.withdraw(c.id, 999_999).await;
    let _ = engine.transfer(b.id, "ACC001", 999_999).await;

    assert_eq!(ledger.total().await?, before + 2500 - 4000);

    // Every balance is explained by its own rows
    for (account, opening) in [(&a, 10000), (&b, 10000), (&c, 0)] {
        let rows = engine.transactions_for(account.id).await?;
        let net: i64 = rows.iter().map(|t| t.signed_delta()).sum();
        assert_eq!(ledger.balance(account).await?, opening + net);
    }
    Ok(())
}

#[tokio::test]
async fn test_statement_covers_range() -> Result<()> {
    let ledger = test_ledger().await?;
    let a = ledger.open(ALICE, "ACC001", 10000).await?;
    ledger.open(BOB, "ACC002", 0).await?;
    let engine = ledger.service.ledger();

    let d = engine.deposit(a.id, 5000).await?;
    let w = engine.withdraw(a.id, 2000).await?;
    let t = engine.transfer(a.id, "ACC002", 1000).await?;

    let from = d.transaction.date - Duration::seconds(1);
    let to = t.sent.date;
    // Activity after the period is rolled back out of the closing balance
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    engine.deposit(a.id, 700).await?;
    let statement = engine.statement(a.id, from, to).await?;

    let ids: Vec<i64> = statement
        .lines
        .iter()
        .map(|l| l.transaction.transaction_id)
        .collect();
    assert_eq!(
        ids,
        vec![
            d.transaction.transaction_id,
            w.transaction.transaction_id,
            t.sent.transaction_id
        ]
    );
    assert_eq!(statement.total_credits, 5000);
    assert_eq!(statement.total_debits, 3000);
    assert_eq!(statement.net_change(), 2000);
    assert_eq!(statement.opening_balance, 10000);
    assert_eq!(statement.closing_balance, 12000);
    assert_eq!(
        statement.opening_balance + statement.net_change(),
        statement.closing_balance
    );
    let balances: Vec<i64> = statement.lines.iter().map(|l| l.balance).collect();
    assert_eq!(balances, vec![15000, 13000, 12000]);
    assert_eq!(ledger.balance(&a).await?, 12700);

    // A window before any activity is empty
    let empty = engine
        .statement(a.id, from - Duration::days(2), from - Duration::days(1))
        .await?;
    assert!(empty.lines.is_empty());
    assert_eq!(empty.opening_balance, 10000);
    assert_eq!(empty.closing_balance, 10000);

    assert!(matches!(
        engine.statement(99, from, to).await,
        Err(LedgerError::AccountNotFound(_))
    ));
    Ok(())
}
