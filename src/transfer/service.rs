//! Bank Service
//!
//! Caller-facing API over a ledger store. `transfer_money` is the only
//! operation that changes balances; everything else is a single-operation
//! transaction over the store.

use std::sync::Arc;

use tokio::time::Instant;
use tracing::{info, warn};

use crate::ledger::{
    Account, AccountId, CreateAccountParams, Entry, EntryId, LedgerError, LedgerQueries,
    LedgerResult, LedgerStore, Page, Transfer, TransferId, run_in_transaction,
    run_in_transaction_until,
};

use super::engine::{TransferParams, transfer_tx};
use super::policy::{OverdraftPolicy, TransferPolicy};
use super::result::TransferResult;

pub struct BankService<S> {
    store: Arc<S>,
    policy: TransferPolicy,
}

impl<S> Clone for BankService<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            policy: self.policy,
        }
    }
}

/// Engine run plus the overdraft check, as one unit of work.
async fn checked_transfer<Q>(
    q: &mut Q,
    params: TransferParams,
    overdraft: OverdraftPolicy,
) -> LedgerResult<TransferResult>
where
    Q: LedgerQueries + ?Sized,
{
    let result = transfer_tx(q, params).await?;
    overdraft.check(&result)?;
    Ok(result)
}

impl<S: LedgerStore> BankService<S> {
    pub fn new(store: S, policy: TransferPolicy) -> Self {
        Self::from_arc(Arc::new(store), policy)
    }

    pub fn from_arc(store: Arc<S>, policy: TransferPolicy) -> Self {
        Self { store, policy }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn policy(&self) -> &TransferPolicy {
        &self.policy
    }

    // === Transfers ===

    /// Move `amount` from one account to another in one transaction.
    ///
    /// Conflict aborts are retried per the retry policy.
    pub async fn transfer_money(&self, params: TransferParams) -> LedgerResult<TransferResult> {
        self.transfer_money_until(params, None).await
    }

    /// [`Self::transfer_money`] bounded by a deadline covering every attempt
    /// and every backoff.
    pub async fn transfer_money_until(
        &self,
        params: TransferParams,
        deadline: Option<Instant>,
    ) -> LedgerResult<TransferResult> {
        if params.amount <= 0 {
            return Err(LedgerError::InvalidAmount(params.amount));
        }

        let retry = self.policy.retry;
        let overdraft = self.policy.overdraft;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;

            let outcome = run_in_transaction_until(self.store.as_ref(), deadline, move |tx| {
                Box::pin(checked_transfer(tx, params, overdraft))
            })
            .await;

            let err = match outcome {
                Ok(result) => {
                    info!(
                        transfer_id = %result.transfer.id,
                        from = %params.from_account_id,
                        to = %params.to_account_id,
                        amount = params.amount,
                        attempts = attempt,
                        "Transfer committed"
                    );
                    return Ok(result);
                }
                Err(err) if err.is_retryable() => err,
                Err(err) => return Err(err),
            };

            if attempt >= retry.max_attempts {
                warn!(
                    from = %params.from_account_id,
                    to = %params.to_account_id,
                    attempts = attempt,
                    error = %err,
                    "Transfer retries exhausted"
                );
                return Err(LedgerError::Store(format!(
                    "{} after {} attempts",
                    err, attempt
                )));
            }

            let delay = retry.backoff(attempt);
            if let Some(deadline) = deadline
                && Instant::now() + delay >= deadline
            {
                return Err(LedgerError::Cancelled);
            }

            warn!(
                from = %params.from_account_id,
                to = %params.to_account_id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Transfer conflicted, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    // === Accounts ===

    pub async fn create_account(&self, params: CreateAccountParams) -> LedgerResult<Account> {
        let account = run_in_transaction(self.store.as_ref(), move |tx| {
            Box::pin(async move { tx.create_account(&params).await })
        })
        .await?;

        info!(
            account_id = %account.id,
            owner = %account.owner,
            currency = %account.currency,
            "Account created"
        );
        Ok(account)
    }

    pub async fn get_account(&self, id: AccountId) -> LedgerResult<Account> {
        run_in_transaction(self.store.as_ref(), move |tx| {
            Box::pin(async move { tx.get_account(id).await })
        })
        .await
    }

    pub async fn list_accounts(&self, page: Page) -> LedgerResult<Vec<Account>> {
        run_in_transaction(self.store.as_ref(), move |tx| {
            Box::pin(async move { tx.list_accounts(page).await })
        })
        .await
    }

    /// Fails with `Store` while entries or transfers still reference the account.
    pub async fn delete_account(&self, id: AccountId) -> LedgerResult<()> {
        run_in_transaction(self.store.as_ref(), move |tx| {
            Box::pin(async move { tx.delete_account(id).await })
        })
        .await?;

        info!(account_id = %id, "Account deleted");
        Ok(())
    }

    // === Ledger history ===

    pub async fn get_entry(&self, id: EntryId) -> LedgerResult<Entry> {
        run_in_transaction(self.store.as_ref(), move |tx| {
            Box::pin(async move { tx.get_entry(id).await })
        })
        .await
    }

    pub async fn list_entries(&self, account_id: AccountId, page: Page) -> LedgerResult<Vec<Entry>> {
        run_in_transaction(self.store.as_ref(), move |tx| {
            Box::pin(async move { tx.list_entries(account_id, page).await })
        })
        .await
    }

    pub async fn get_transfer(&self, id: TransferId) -> LedgerResult<Transfer> {
        run_in_transaction(self.store.as_ref(), move |tx| {
            Box::pin(async move { tx.get_transfer(id).await })
        })
        .await
    }

    pub async fn list_transfers(
        &self,
        account_id: AccountId,
        page: Page,
    ) -> LedgerResult<Vec<Transfer>> {
        run_in_transaction(self.store.as_ref(), move |tx| {
            Box::pin(async move { tx.list_transfers(account_id, page).await })
        })
        .await
    }
}
