//! Helpers shared by every engine that writes the ledger.

use std::future::Future;

use anyhow::Context;
use tracing::{debug, warn};

use crate::config::LedgerConfig;
use crate::storage::Unit;

use super::LedgerError;

/// End a unit: commit on success, roll back explicitly on failure.
pub(crate) async fn settle<T>(
    unit: Unit,
    result: Result<T, LedgerError>,
) -> Result<T, LedgerError> {
    match result {
        Ok(value) => {
            unit.commit().await.context("Failed to commit ledger unit")?;
            Ok(value)
        }
        Err(err) => {
            if let Err(e) = unit.rollback().await {
                warn!(error = %e, cause = %err, "rollback failed");
            }
            Err(err)
        }
    }
}

/// Run `attempt` again while it fails with a lock timeout, up to
/// `config.lock_retries` extra times with linear backoff.
pub(crate) async fn retrying<T, F, Fut>(
    config: &LedgerConfig,
    op: &'static str,
    mut attempt: F,
) -> Result<T, LedgerError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, LedgerError>>,
{
    let mut retries = 0;
    loop {
        match attempt().await {
            Err(err) if err.is_retryable() && retries < config.lock_retries => {
                retries += 1;
                debug!(op, retry = retries, error = %err, "lock contention, retrying");
                tokio::time::sleep(config.retry_backoff * retries).await;
            }
            result => return result,
        }
    }
}
