//! Transaction Coordinator
//!
//! Runs a unit of work inside one ledger transaction and guarantees exactly
//! one commit or one rollback per invocation.
//!
//! A unit of work is a closure receiving the open transaction:
//!
//! ```ignore
//! let account = run_in_transaction(&store, move |tx| {
//!     Box::pin(async move { tx.get_account(id).await })
//! })
//! .await?;
//! ```

use futures::future::BoxFuture;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, error, warn};

use super::error::{LedgerError, LedgerResult};
use super::store::{LedgerStore, LedgerTx};

/// Run `work` in a fresh transaction.
///
/// - `work` fails: roll back and return its error. If the rollback itself
///   fails, `LedgerError::RollbackFailed` is returned instead and the original
///   error is only logged.
/// - `work` succeeds: commit. A commit failure is returned as-is.
///
/// No retries happen here.
pub async fn run_in_transaction<S, T, F>(store: &S, work: F) -> LedgerResult<T>
where
    S: LedgerStore + ?Sized,
    T: Send,
    F: for<'t> FnOnce(&'t mut S::Tx) -> BoxFuture<'t, LedgerResult<T>> + Send,
{
    run_in_transaction_until(store, None, work).await
}

/// Same as [`run_in_transaction`], bounded by an optional caller deadline.
///
/// When the deadline passes, the in-flight work is dropped, the transaction is
/// rolled back and `LedgerError::Cancelled` is returned.
pub async fn run_in_transaction_until<S, T, F>(
    store: &S,
    deadline: Option<Instant>,
    work: F,
) -> LedgerResult<T>
where
    S: LedgerStore + ?Sized,
    T: Send,
    F: for<'t> FnOnce(&'t mut S::Tx) -> BoxFuture<'t, LedgerResult<T>> + Send,
{
    let mut tx = match deadline {
        Some(deadline) => timeout_at(deadline, store.begin())
            .await
            .map_err(|_| LedgerError::Cancelled)??,
        None => store.begin().await?,
    };

    let outcome = match deadline {
        Some(deadline) => match timeout_at(deadline, work(&mut tx)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!("Unit of work exceeded caller deadline, rolling back");
                Err(LedgerError::Cancelled)
            }
        },
        None => work(&mut tx).await,
    };

    finish(tx, outcome).await
}

async fn finish<Tx, T>(tx: Tx, outcome: LedgerResult<T>) -> LedgerResult<T>
where
    Tx: LedgerTx,
    T: Send,
{
    match outcome {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(err) => match tx.rollback().await {
            Ok(()) => {
                debug!(error = %err, "Transaction rolled back");
                Err(err)
            }
            Err(rollback_err) => {
                error!(
                    cause = %err,
                    error = %rollback_err,
                    "Rollback failed, discarding original error"
                );
                Err(LedgerError::RollbackFailed(rollback_err.to_string()))
            }
        },
    }
}
