mod common;

use anyhow::Result;
use common::{ALICE, BOB, test_ledger};
use strongroom::application::{ErrorKind, LedgerError};
use strongroom::domain::{DisputeStatus, TransactionKind};

#[tokio::test]
async fn test_approve_reverses_transaction() -> Result<()> {
    let ledger = test_ledger().await?;
    let a = ledger.open(ALICE, "ACC001", 10000).await?;

    let deposit = ledger.service.ledger().deposit(a.id, 5000).await?;
    let tx_id = deposit.transaction.transaction_id;

    let dispute = ledger
        .service
        .disputes()
        .raise_dispute(ALICE, tx_id, "  duplicate charge ")
        .await?;
    assert_eq!(dispute.status, DisputeStatus::Pending);
    assert_eq!(dispute.reason, "duplicate charge");

    let review = ledger.service.disputes().review_dispute(dispute.id, true).await?;

    assert_eq!(review.dispute.status, DisputeStatus::Approved);
    let reversal = review.reversal.expect("approval reverses");
    assert_eq!(reversal.original.transaction_id, tx_id);
    assert_eq!(reversal.compensating[0].kind, TransactionKind::Withdraw);
    assert_eq!(ledger.balance(&a).await?, 10000);
    assert!(ledger.service.ledger().get_transaction(tx_id).await?.reversed);

    // Reviewing again is rejected and changes nothing
    let err = ledger
        .service
        .disputes()
        .review_dispute(dispute.id, true)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        LedgerError::AlreadyReviewed {
            status: DisputeStatus::Approved,
            ..
        }
    ));
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(ledger.balance(&a).await?, 10000);
    Ok(())
}

#[tokio::test]
async fn test_reject_leaves_transaction_alone() -> Result<()> {
    let ledger = test_ledger().await?;
    let a = ledger.open(ALICE, "ACC001", 10000).await?;
    let deposit = ledger.service.ledger().deposit(a.id, 5000).await?;
    let tx_id = deposit.transaction.transaction_id;

    let dispute = ledger
        .service
        .disputes()
        .raise_dispute(ALICE, tx_id, "not me")
        .await?;
    let review = ledger.service.disputes().review_dispute(dispute.id, false).await?;

    assert_eq!(review.dispute.status, DisputeStatus::Rejected);
    assert!(review.reversal.is_none());
    assert_eq!(ledger.balance(&a).await?, 15000);
    assert!(!ledger.service.ledger().get_transaction(tx_id).await?.reversed);

    // A rejected dispute does not block a fresh one
    let again = ledger
        .service
        .disputes()
        .raise_dispute(ALICE, tx_id, "really not me")
        .await?;
    assert_eq!(again.status, DisputeStatus::Pending);
    Ok(())
}

#[tokio::test]
async fn test_raise_dispute_errors() -> Result<()> {
    let ledger = test_ledger().await?;
    let a = ledger.open(ALICE, "ACC001", 10000).await?;
    let deposit = ledger.service.ledger().deposit(a.id, 5000).await?;
    let tx_id = deposit.transaction.transaction_id;
    let disputes = ledger.service.disputes();

    assert!(matches!(
        disputes.raise_dispute(ALICE, tx_id, "   ").await,
        Err(LedgerError::InvalidReason(_))
    ));
    assert!(matches!(
        disputes.raise_dispute(ALICE, 999, "unknown").await,
        Err(LedgerError::TransactionNotFound(999))
    ));

    disputes.raise_dispute(ALICE, tx_id, "first").await?;
    assert!(matches!(
        disputes.raise_dispute(BOB, tx_id, "second").await,
        Err(LedgerError::DuplicatePendingDispute(x)) if x == tx_id
    ));

    let withdrawal = ledger.service.ledger().withdraw(a.id, 1000).await?;
    ledger
        .service
        .ledger()
        .reverse_transaction(withdrawal.transaction.transaction_id)
        .await?;
    assert!(matches!(
        disputes
            .raise_dispute(ALICE, withdrawal.transaction.transaction_id, "late")
            .await,
        Err(LedgerError::AlreadyReversed(_))
    ));
    Ok(())
}

#[tokio::test]
async fn test_failed_reversal_keeps_dispute_pending() -> Result<()> {
    let ledger = test_ledger().await?;
    let a = ledger.open(ALICE, "ACC001", 0).await?;
    let engine = ledger.service.ledger();

    let deposit = engine.deposit(a.id, 5000).await?;
    engine.withdraw(a.id, 4500).await?;

    let dispute = ledger
        .service
        .disputes()
        .raise_dispute(ALICE, deposit.transaction.transaction_id, "fraud")
        .await?;

    let err = ledger
        .service
        .disputes()
        .review_dispute(dispute.id, true)
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::InsufficientBalanceForReversal { .. }));

    let current = ledger.service.disputes().get_dispute(dispute.id).await?;
    assert_eq!(current.status, DisputeStatus::Pending);
    assert_eq!(ledger.balance(&a).await?, 500);
    assert!(
        !engine
            .get_transaction(deposit.transaction.transaction_id)
            .await?
            .reversed
    );

    // Once funds are back the same dispute can still be approved
    engine.deposit(a.id, 4500).await?;
    let review = ledger.service.disputes().review_dispute(dispute.id, true).await?;
    assert_eq!(review.dispute.status, DisputeStatus::Approved);
    assert_eq!(ledger.balance(&a).await?, 0);
    Ok(())
}

#[tokio::test]
async fn test_listing_disputes() -> Result<()> {
    let ledger = test_ledger().await?;
    let a = ledger.open(ALICE, "ACC001", 10000).await?;
    let b = ledger.open(BOB, "ACC002", 0).await?;
    let engine = ledger.service.ledger();
    let disputes = ledger.service.disputes();

    let d1 = engine.deposit(a.id, 100).await?;
    let d2 = engine.deposit(a.id, 200).await?;
    let d3 = engine.deposit(a.id, 300).await?;
    let t = engine.transfer(a.id, "ACC002", 400).await?;

    let first = disputes
        .raise_dispute(ALICE, d1.transaction.transaction_id, "one")
        .await?;
    let second = disputes
        .raise_dispute(ALICE, d2.transaction.transaction_id, "two")
        .await?;
    let third = disputes
        .raise_dispute(ALICE, d3.transaction.transaction_id, "three")
        .await?;
    disputes
        .raise_dispute(BOB, t.received.transaction_id, "four")
        .await?;
    disputes.review_dispute(second.id, true).await?;
    disputes.review_dispute(third.id, false).await?;

    assert_eq!(disputes.list_disputes(None).await?.len(), 4);
    let pending = disputes.list_disputes(Some(DisputeStatus::Pending)).await?;
    assert_eq!(pending.len(), 2);
    // Newest first
    assert!(pending[0].id > pending[1].id);

    let active = disputes.active_disputes_for_account(a.id).await?;
    assert_eq!(
        active,
        vec![d1.transaction.transaction_id, d2.transaction.transaction_id]
    );
    assert_eq!(
        disputes.active_disputes_for_account(b.id).await?,
        vec![t.received.transaction_id]
    );

    assert_eq!(disputes.get_dispute(first.id).await?, first);
    assert!(matches!(
        disputes.get_dispute(999).await,
        Err(LedgerError::DisputeNotFound(999))
    ));
    assert!(matches!(
        disputes.review_dispute(999, false).await,
        Err(LedgerError::DisputeNotFound(999))
    ));
    Ok(())
}
