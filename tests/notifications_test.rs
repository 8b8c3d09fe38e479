mod common;

use std::sync::Arc;

use anyhow::Result;
use common::{ALICE, BOB, CAROL, FailingSink, test_config, test_directory, test_ledger};
use strongroom::application::{EventKind, LedgerService};
use strongroom::domain::{AccountType, DisputeStatus};
use tempfile::TempDir;

#[tokio::test]
async fn test_events_follow_committed_changes() -> Result<()> {
    let ledger = test_ledger().await?;
    let a = ledger.open(ALICE, "ACC001", 10000).await?;
    ledger.open(BOB, "ACC002", 0).await?;
    let engine = ledger.service.ledger();

    let deposit = engine.deposit(a.id, 500).await?;
    engine.withdraw(a.id, 200).await?;
    engine.transfer(a.id, "ACC002", 300).await?;
    // Rejected operations notify nobody
    let _ = engine.withdraw(a.id, 1_000_000).await;

    let dispute = ledger
        .service
        .disputes()
        .raise_dispute(ALICE, deposit.transaction.transaction_id, "wrong amount")
        .await?;
    ledger.service.disputes().review_dispute(dispute.id, false).await?;
    ledger.service.drain_notifications().await;

    let mut alice = ledger.sink.events_for("alice@example.com");
    alice.sort_by_key(|e| e.name());
    let mut expected = vec![
        EventKind::AccountOpened,
        EventKind::DepositConfirmed,
        EventKind::WithdrawConfirmed,
        EventKind::TransferSent,
        EventKind::DisputeRaised,
        EventKind::DisputeResolved(DisputeStatus::Rejected),
    ];
    expected.sort_by_key(|e| e.name());
    assert_eq!(alice, expected);

    let mut bob = ledger.sink.events_for("bob@example.com");
    bob.sort_by_key(|e| e.name());
    assert_eq!(bob, vec![EventKind::AccountOpened, EventKind::TransferReceived]);

    let received = ledger
        .sink
        .delivered()
        .into_iter()
        .find(|n| n.event == EventKind::TransferReceived)
        .expect("transfer received notification");
    assert_eq!(received.payload["amount"], "3.00");
    assert_eq!(received.payload["from_account_number"], "ACC001");
    Ok(())
}

#[tokio::test]
async fn test_owner_without_contact_is_skipped() -> Result<()> {
    let ledger = test_ledger().await?;
    let c = ledger.open(CAROL, "ACC003", 0).await?;
    ledger.service.ledger().deposit(c.id, 100).await?;
    ledger.service.drain_notifications().await;

    assert!(ledger.sink.delivered().is_empty());
    assert_eq!(ledger.balance(&c).await?, 100);
    Ok(())
}

#[tokio::test]
async fn test_failing_sink_never_fails_operations() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let service = LedgerService::init(
        test_config(&temp_dir),
        test_directory().await,
        Arc::new(FailingSink),
    )
    .await?;

    let a = service
        .accounts()
        .create(ALICE, "ACC001", 10000, AccountType::Saving)
        .await?;
    service
        .accounts()
        .create(BOB, "ACC002", 0, AccountType::Current)
        .await?;

    service.ledger().deposit(a.id, 500).await?;
    service.ledger().withdraw(a.id, 500).await?;
    service.ledger().transfer(a.id, "ACC002", 1000).await?;
    service.drain_notifications().await;

    assert_eq!(service.accounts().get(a.id).await?.balance, 9000);
    assert_eq!(service.accounts().get_by_number("ACC002").await?.balance, 1000);
    Ok(())
}
