//! Ledger Store Ports
//!
//! Single-row operations against accounts, entries and transfers, always
//! scoped to an open transaction. Implementations live in
//! [`super::postgres`] and [`super::memory`].

use async_trait::async_trait;

use super::error::LedgerResult;
use super::models::{
    Account, AccountId, CreateAccountParams, CreateTransferParams, Entry, EntryId, Page, Transfer,
    TransferId,
};

/// Transaction-scoped CRUD operations.
///
/// Every operation fails with `LedgerError::NotFound` when the addressed row
/// (or a referenced account) does not exist.
#[async_trait]
pub trait LedgerQueries: Send {
    // === Accounts ===

    async fn create_account(&mut self, params: &CreateAccountParams) -> LedgerResult<Account>;

    async fn get_account(&mut self, id: AccountId) -> LedgerResult<Account>;

    /// Read an account and hold its exclusive row lock until the transaction ends.
    ///
    /// Calling this again for an account the transaction already holds must
    /// not block.
    async fn get_account_for_update(&mut self, id: AccountId) -> LedgerResult<Account>;

    async fn list_accounts(&mut self, page: Page) -> LedgerResult<Vec<Account>>;

    /// Overwrite the balance. Takes the row lock.
    async fn update_account_balance(
        &mut self,
        id: AccountId,
        balance: i64,
    ) -> LedgerResult<Account>;

    /// Add `delta` to the balance in one statement. Takes the row lock.
    async fn add_account_balance(&mut self, id: AccountId, delta: i64) -> LedgerResult<Account>;

    async fn delete_account(&mut self, id: AccountId) -> LedgerResult<()>;

    // === Entries ===

    async fn create_entry(&mut self, account_id: AccountId, amount: i64) -> LedgerResult<Entry>;

    async fn get_entry(&mut self, id: EntryId) -> LedgerResult<Entry>;

    async fn list_entries(&mut self, account_id: AccountId, page: Page)
    -> LedgerResult<Vec<Entry>>;

    // === Transfers ===

    async fn create_transfer(&mut self, params: &CreateTransferParams) -> LedgerResult<Transfer>;

    async fn get_transfer(&mut self, id: TransferId) -> LedgerResult<Transfer>;

    /// Transfers where `account_id` is either the source or the destination.
    async fn list_transfers(
        &mut self,
        account_id: AccountId,
        page: Page,
    ) -> LedgerResult<Vec<Transfer>>;
}

/// An open transaction. Consumed by exactly one of `commit` or `rollback`.
#[async_trait]
pub trait LedgerTx: LedgerQueries + Sized {
    async fn commit(self) -> LedgerResult<()>;

    async fn rollback(self) -> LedgerResult<()>;
}

/// Entry point to a ledger backend.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    type Tx: LedgerTx + 'static;

    /// Begin a transaction with the backend's default isolation level.
    async fn begin(&self) -> LedgerResult<Self::Tx>;
}
