use std::sync::Arc;

use serde_json::json;
use tracing::info;

use crate::config::LedgerConfig;
use crate::domain::{AccountId, Dispute, DisputeId, DisputeStatus, OwnerId, TransactionId};
use crate::storage::{Repository, is_unique_violation};

use super::unit::{retrying, settle};
use super::{EventKind, LedgerEngine, LedgerError, Notifier, Reversal};

/// Outcome of reviewing a dispute.
#[derive(Debug, Clone)]
pub struct Review {
    pub dispute: Dispute,
    /// Present when the dispute was approved
    pub reversal: Option<Reversal>,
}

/// Lets owners contest a transaction and admins approve (reverse) or reject it.
#[derive(Clone)]
pub struct DisputeEngine {
    repo: Repository,
    ledger: LedgerEngine,
    notifier: Notifier,
    config: Arc<LedgerConfig>,
}

impl DisputeEngine {
    pub fn new(
        repo: Repository,
        ledger: LedgerEngine,
        notifier: Notifier,
        config: Arc<LedgerConfig>,
    ) -> Self {
        Self {
            repo,
            ledger,
            notifier,
            config,
        }
    }

    /// Open a pending dispute against a transaction.
    pub async fn raise_dispute(
        &self,
        user_id: OwnerId,
        transaction_id: TransactionId,
        reason: &str,
    ) -> Result<Dispute, LedgerError> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(LedgerError::InvalidReason("reason must not be empty".into()));
        }

        let dispute = retrying(&self.config, "raise_dispute", move || {
            self.try_raise(user_id, transaction_id, reason)
        })
        .await?;

        info!(
            dispute = dispute.id,
            transaction = transaction_id,
            user = user_id,
            "dispute raised"
        );
        self.notifier.dispatch(
            user_id,
            EventKind::DisputeRaised,
            json!({
                "dispute_id": dispute.id,
                "transaction_id": transaction_id,
                "reason": dispute.reason,
            }),
        );
        Ok(dispute)
    }

    async fn try_raise(
        &self,
        user_id: OwnerId,
        transaction_id: TransactionId,
        reason: &str,
    ) -> Result<Dispute, LedgerError> {
        let inserted = self
            .repo
            .insert_dispute_for(user_id, transaction_id, reason, Repository::timestamp())
            .await;

        match inserted {
            Ok(Some(dispute)) => Ok(dispute),
            Ok(None) => Err(match self.repo.get_transaction(transaction_id).await? {
                None => LedgerError::TransactionNotFound(transaction_id),
                Some(_) => LedgerError::AlreadyReversed(transaction_id),
            }),
            Err(e) if is_unique_violation(&e) => {
                Err(LedgerError::DuplicatePendingDispute(transaction_id))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Approve or reject a pending dispute.
    ///
    /// Approval reverses the disputed transaction in the same unit that closes
    /// the dispute. If the reversal fails, nothing changes and the dispute
    /// stays pending.
    pub async fn review_dispute(
        &self,
        dispute_id: DisputeId,
        approve: bool,
    ) -> Result<Review, LedgerError> {
        let review = retrying(&self.config, "review_dispute", move || {
            self.try_review(dispute_id, approve)
        })
        .await?;

        info!(
            dispute = dispute_id,
            transaction = review.dispute.transaction_id,
            status = %review.dispute.status,
            "dispute reviewed"
        );
        self.notifier.dispatch(
            review.dispute.user_id,
            EventKind::DisputeResolved(review.dispute.status),
            json!({
                "dispute_id": dispute_id,
                "transaction_id": review.dispute.transaction_id,
                "status": review.dispute.status.as_str(),
            }),
        );
        Ok(review)
    }

    async fn try_review(
        &self,
        dispute_id: DisputeId,
        approve: bool,
    ) -> Result<Review, LedgerError> {
        let dispute = self.get_dispute(dispute_id).await?;
        if dispute.status.is_terminal() {
            return Err(LedgerError::AlreadyReviewed {
                dispute_id,
                status: dispute.status,
            });
        }

        let locks = if approve {
            let transaction = self
                .repo
                .get_transaction(dispute.transaction_id)
                .await?
                .ok_or(LedgerError::TransactionNotFound(dispute.transaction_id))?;
            Some(self.ledger.lock_accounts(&transaction.accounts_touched()).await?)
        } else {
            None
        };

        let status = DisputeStatus::from_decision(approve);
        let mut unit = self.repo.begin().await?;

        let result: Result<Review, LedgerError> = async {
            let now = Repository::timestamp();
            let resolved =
                match Repository::resolve_dispute(&mut unit, dispute_id, status, now).await? {
                    Some(resolved) => resolved,
                    None => {
                        return Err(match Repository::find_dispute(&mut unit, dispute_id).await? {
                            None => LedgerError::DisputeNotFound(dispute_id),
                            Some(current) => LedgerError::AlreadyReviewed {
                                dispute_id,
                                status: current.status,
                            },
                        });
                    }
                };

            let reversal = match &locks {
                Some(locks) => Some(
                    LedgerEngine::apply_reversal(&mut unit, locks, resolved.transaction_id).await?,
                ),
                None => None,
            };

            Ok(Review {
                dispute: resolved,
                reversal,
            })
        }
        .await;

        settle(unit, result).await
    }

    /// Get a dispute by ID.
    pub async fn get_dispute(&self, dispute_id: DisputeId) -> Result<Dispute, LedgerError> {
        self.repo
            .get_dispute(dispute_id)
            .await?
            .ok_or(LedgerError::DisputeNotFound(dispute_id))
    }

    /// List disputes, newest first.
    pub async fn list_disputes(
        &self,
        status: Option<DisputeStatus>,
    ) -> Result<Vec<Dispute>, LedgerError> {
        Ok(self.repo.list_disputes(status).await?)
    }

    /// Transactions of an account that are pending review or were approved.
    pub async fn active_disputes_for_account(
        &self,
        account_id: AccountId,
    ) -> Result<Vec<TransactionId>, LedgerError> {
        Ok(self.repo.active_disputed_transactions(account_id).await?)
    }
}
