//! In-Memory Ledger Store
//!
//! A process-local implementation of the ledger store with the same locking
//! behaviour as the PostgreSQL store:
//!
//! - every account row has its own async lock; balance writes and
//!   `get_account_for_update` take it and keep it until the transaction ends
//! - a transaction stages its writes and publishes them atomically on commit
//!   (readers see committed rows plus their own staged rows)
//! - a transaction never waits on a lock it already holds
//! - inserts that reference an account share-lock its key until the
//!   transaction ends, and a delete takes the key exclusively, so an account
//!   cannot be deleted under an uncommitted entry or transfer
//!
//! Faults can be injected per operation to exercise rollback paths, and an
//! optional lock-wait timeout turns long waits into `DeadlockDetected`, the
//! way a database deadlock detector would.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{
    Mutex as RowLock, OwnedMutexGuard, OwnedRwLockReadGuard, OwnedRwLockWriteGuard,
    RwLock as KeyLock,
};
use tracing::{debug, warn};

use super::error::{Entity, LedgerError, LedgerResult};
use super::models::{
    Account, AccountId, CreateAccountParams, CreateTransferParams, Entry, EntryId, Page, Transfer,
    TransferId,
};
use super::store::{LedgerQueries, LedgerStore, LedgerTx};

// ============================================================================
// Fault Injection
// ============================================================================

/// Store operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Begin,
    Commit,
    Rollback,
    CreateAccount,
    GetAccount,
    GetAccountForUpdate,
    ListAccounts,
    UpdateAccountBalance,
    AddAccountBalance,
    DeleteAccount,
    CreateEntry,
    GetEntry,
    ListEntries,
    CreateTransfer,
    GetTransfer,
    ListTransfers,
}

/// Error kind produced by an injected fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    Store,
    DeadlockDetected,
    SerializationFailure,
}

impl FaultKind {
    fn into_error(self, op: StoreOp) -> LedgerError {
        let msg = format!("injected fault on {:?}", op);
        match self {
            FaultKind::Store => LedgerError::Store(msg),
            FaultKind::DeadlockDetected => LedgerError::DeadlockDetected(msg),
            FaultKind::SerializationFailure => LedgerError::SerializationFailure(msg),
        }
    }
}

#[derive(Debug)]
struct Fault {
    op: StoreOp,
    /// Calls of `op` still to let through before firing.
    skip: usize,
    kind: FaultKind,
}

// ============================================================================
// Shared State
// ============================================================================

#[derive(Debug, Default)]
struct Tables {
    accounts: BTreeMap<AccountId, Account>,
    entries: BTreeMap<EntryId, Entry>,
    transfers: BTreeMap<TransferId, Transfer>,
    last_account_id: i64,
    last_entry_id: i64,
    last_transfer_id: i64,
}

impl Tables {
    fn next_account_id(&mut self) -> AccountId {
        self.last_account_id += 1;
        AccountId(self.last_account_id)
    }

    fn next_entry_id(&mut self) -> EntryId {
        self.last_entry_id += 1;
        EntryId(self.last_entry_id)
    }

    fn next_transfer_id(&mut self) -> TransferId {
        self.last_transfer_id += 1;
        TransferId(self.last_transfer_id)
    }

    fn is_referenced(&self, id: AccountId) -> bool {
        self.entries.values().any(|e| e.account_id == id)
            || self
                .transfers
                .values()
                .any(|t| t.from_account_id == id || t.to_account_id == id)
    }
}

#[derive(Debug, Default)]
struct Shared {
    tables: Mutex<Tables>,
    row_locks: Mutex<HashMap<AccountId, Arc<RowLock<()>>>>,
    key_locks: Mutex<HashMap<AccountId, Arc<KeyLock<()>>>>,
    faults: Mutex<Vec<Fault>>,
    lock_timeout: Option<Duration>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn tables(&self) -> MutexGuard<'_, Tables> {
        lock(&self.tables)
    }

    /// Fire the first pending fault registered for `op`, if it is due.
    fn trip(&self, op: StoreOp) -> LedgerResult<()> {
        let mut faults = lock(&self.faults);
        let Some(pos) = faults.iter().position(|f| f.op == op) else {
            return Ok(());
        };
        if faults[pos].skip > 0 {
            faults[pos].skip -= 1;
            return Ok(());
        }
        let fault = faults.remove(pos);
        debug!(?op, kind = ?fault.kind, "Injected fault fired");
        Err(fault.kind.into_error(op))
    }

    fn row_lock(&self, id: AccountId) -> Arc<RowLock<()>> {
        lock(&self.row_locks).entry(id).or_default().clone()
    }

    fn key_lock(&self, id: AccountId) -> Arc<KeyLock<()>> {
        lock(&self.key_locks).entry(id).or_default().clone()
    }

    /// Drop the lock entries of a deleted account.
    ///
    /// Waiters still queued on the old locks find the row gone once they
    /// get through.
    fn forget_locks(&self, id: AccountId) {
        lock(&self.row_locks).remove(&id);
        lock(&self.key_locks).remove(&id);
    }

    /// Wait for a lock on account `id`, bounded by the lock-wait timeout.
    async fn wait_for<G>(
        &self,
        id: AccountId,
        acquire: impl Future<Output = G>,
    ) -> LedgerResult<G> {
        let Some(timeout) = self.lock_timeout else {
            return Ok(acquire.await);
        };
        tokio::time::timeout(timeout, acquire).await.map_err(|_| {
            warn!(account_id = %id, ?timeout, "Lock wait timed out");
            LedgerError::DeadlockDetected(format!(
                "lock wait on account {} exceeded {:?}",
                id, timeout
            ))
        })
    }
}

/// Committed row counts, for assertions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RowCounts {
    pub accounts: usize,
    pub entries: usize,
    pub transfers: usize,
}

// ============================================================================
// Store
// ============================================================================

/// In-memory ledger. Cloning shares the same tables.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report lock waits longer than `timeout` as `DeadlockDetected`.
    pub fn with_lock_timeout(timeout: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                lock_timeout: Some(timeout),
                ..Default::default()
            }),
        }
    }

    /// Make the `nth` (1-based) next call of `op` fail with `kind`.
    ///
    /// Several faults may be queued for the same operation; they fire in
    /// registration order.
    pub fn fail_on(&self, op: StoreOp, nth: usize, kind: FaultKind) {
        lock(&self.shared.faults).push(Fault {
            op,
            skip: nth.saturating_sub(1),
            kind,
        });
    }

    /// Insert a committed account directly, outside any transaction.
    pub fn insert_account(&self, params: CreateAccountParams) -> Account {
        let mut tables = self.shared.tables();
        let account = Account {
            id: tables.next_account_id(),
            owner: params.owner,
            balance: params.balance,
            currency: params.currency,
            created_at: Utc::now(),
        };
        tables.accounts.insert(account.id, account.clone());
        account
    }

    /// Committed state of an account.
    pub fn account(&self, id: AccountId) -> Option<Account> {
        self.shared.tables().accounts.get(&id).cloned()
    }

    pub fn counts(&self) -> RowCounts {
        let tables = self.shared.tables();
        RowCounts {
            accounts: tables.accounts.len(),
            entries: tables.entries.len(),
            transfers: tables.transfers.len(),
        }
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    type Tx = MemoryTx;

    async fn begin(&self) -> LedgerResult<MemoryTx> {
        self.shared.trip(StoreOp::Begin)?;
        Ok(MemoryTx {
            shared: self.shared.clone(),
            held: HashMap::new(),
            key_shares: HashMap::new(),
            key_excl: HashMap::new(),
            accounts: BTreeMap::new(),
            entries: BTreeMap::new(),
            transfers: BTreeMap::new(),
        })
    }
}

// ============================================================================
// Transaction
// ============================================================================

/// An open in-memory transaction.
///
/// Dropping it without commit discards the staged writes and releases every
/// row lock it holds.
pub struct MemoryTx {
    shared: Arc<Shared>,
    held: HashMap<AccountId, OwnedMutexGuard<()>>,
    /// Key locks shared by staged entries and transfers.
    key_shares: HashMap<AccountId, OwnedRwLockReadGuard<()>>,
    /// Key locks taken by staged deletes.
    key_excl: HashMap<AccountId, OwnedRwLockWriteGuard<()>>,
    /// Staged account rows; `None` marks a staged delete.
    accounts: BTreeMap<AccountId, Option<Account>>,
    entries: BTreeMap<EntryId, Entry>,
    transfers: BTreeMap<TransferId, Transfer>,
}

impl MemoryTx {
    /// Acquire the row lock for `id` unless this transaction already holds it.
    async fn lock_row(&mut self, id: AccountId) -> LedgerResult<()> {
        if self.held.contains_key(&id) {
            return Ok(());
        }

        let row = self.shared.row_lock(id);
        let guard = self.shared.wait_for(id, row.lock_owned()).await?;
        self.held.insert(id, guard);
        Ok(())
    }

    /// Share-lock the key of an account that a staged row will reference.
    ///
    /// Blocks while another transaction has a delete of the account pending,
    /// then re-checks that the account still exists.
    async fn share_key(&mut self, id: AccountId) -> LedgerResult<()> {
        if !self.account_exists(id) {
            return Err(LedgerError::account_not_found(id));
        }
        if !self.key_shares.contains_key(&id) && !self.key_excl.contains_key(&id) {
            let key = self.shared.key_lock(id);
            let guard = self.shared.wait_for(id, key.read_owned()).await?;
            self.key_shares.insert(id, guard);
        }
        if !self.account_exists(id) {
            return Err(LedgerError::account_not_found(id));
        }
        Ok(())
    }

    /// Take the key of `id` exclusively, waiting out uncommitted inserts of
    /// other transactions that reference it.
    async fn own_key(&mut self, id: AccountId) -> LedgerResult<()> {
        if self.key_excl.contains_key(&id) {
            return Ok(());
        }
        // A share left over from a failed insert would block our own upgrade.
        self.key_shares.remove(&id);
        let key = self.shared.key_lock(id);
        let guard = self.shared.wait_for(id, key.write_owned()).await?;
        self.key_excl.insert(id, guard);
        Ok(())
    }

    fn stages_reference_to(&self, id: AccountId) -> bool {
        self.entries.values().any(|e| e.account_id == id)
            || self
                .transfers
                .values()
                .any(|t| t.from_account_id == id || t.to_account_id == id)
    }

    /// Current view of an account: staged row if any, else committed row.
    fn visible_account(&self, id: AccountId) -> LedgerResult<Account> {
        let visible = match self.accounts.get(&id) {
            Some(staged) => staged.clone(),
            None => self.shared.tables().accounts.get(&id).cloned(),
        };
        visible.ok_or_else(|| LedgerError::account_not_found(id))
    }

    fn account_exists(&self, id: AccountId) -> bool {
        self.visible_account(id).is_ok()
    }

    fn visible_accounts(&self) -> BTreeMap<AccountId, Account> {
        let mut rows = self.shared.tables().accounts.clone();
        for (id, staged) in &self.accounts {
            match staged {
                Some(account) => rows.insert(*id, account.clone()),
                None => rows.remove(id),
            };
        }
        rows
    }

    async fn write_balance(
        &mut self,
        id: AccountId,
        balance: impl FnOnce(i64) -> LedgerResult<i64>,
    ) -> LedgerResult<Account> {
        self.lock_row(id).await?;
        let mut account = self.visible_account(id)?;
        account.balance = balance(account.balance)?;
        self.accounts.insert(id, Some(account.clone()));
        Ok(account)
    }
}

#[async_trait]
impl LedgerQueries for MemoryTx {
    async fn create_account(&mut self, params: &CreateAccountParams) -> LedgerResult<Account> {
        self.shared.trip(StoreOp::CreateAccount)?;
        let id = self.shared.tables().next_account_id();
        let account = Account {
            id,
            owner: params.owner.clone(),
            balance: params.balance,
            currency: params.currency,
            created_at: Utc::now(),
        };
        self.accounts.insert(id, Some(account.clone()));
        Ok(account)
    }

    async fn get_account(&mut self, id: AccountId) -> LedgerResult<Account> {
        self.shared.trip(StoreOp::GetAccount)?;
        self.visible_account(id)
    }

    async fn get_account_for_update(&mut self, id: AccountId) -> LedgerResult<Account> {
        self.shared.trip(StoreOp::GetAccountForUpdate)?;
        // Absent rows are not locked.
        self.visible_account(id)?;
        self.lock_row(id).await?;
        self.visible_account(id)
    }

    async fn list_accounts(&mut self, page: Page) -> LedgerResult<Vec<Account>> {
        self.shared.trip(StoreOp::ListAccounts)?;
        Ok(page.slice(self.visible_accounts().into_values()))
    }

    async fn update_account_balance(
        &mut self,
        id: AccountId,
        balance: i64,
    ) -> LedgerResult<Account> {
        self.shared.trip(StoreOp::UpdateAccountBalance)?;
        self.write_balance(id, |_| Ok(balance)).await
    }

    async fn add_account_balance(&mut self, id: AccountId, delta: i64) -> LedgerResult<Account> {
        self.shared.trip(StoreOp::AddAccountBalance)?;
        self.write_balance(id, |current| {
            current.checked_add(delta).ok_or_else(|| {
                LedgerError::Store(format!("balance of account {} out of range", id))
            })
        })
        .await
    }

    async fn delete_account(&mut self, id: AccountId) -> LedgerResult<()> {
        self.shared.trip(StoreOp::DeleteAccount)?;
        self.visible_account(id)?;
        let referenced = |id: AccountId| {
            LedgerError::Store(format!(
                "account {} is still referenced by ledger rows",
                id
            ))
        };
        if self.stages_reference_to(id) {
            return Err(referenced(id));
        }

        self.lock_row(id).await?;
        self.own_key(id).await?;
        // Another delete may have won the row lock.
        self.visible_account(id)?;
        if self.shared.tables().is_referenced(id) {
            return Err(referenced(id));
        }

        self.accounts.insert(id, None);
        Ok(())
    }

    async fn create_entry(&mut self, account_id: AccountId, amount: i64) -> LedgerResult<Entry> {
        self.shared.trip(StoreOp::CreateEntry)?;
        self.share_key(account_id).await?;
        let entry = Entry {
            id: self.shared.tables().next_entry_id(),
            account_id,
            amount,
            created_at: Utc::now(),
        };
        self.entries.insert(entry.id, entry.clone());
        Ok(entry)
    }

    async fn get_entry(&mut self, id: EntryId) -> LedgerResult<Entry> {
        self.shared.trip(StoreOp::GetEntry)?;
        self.entries
            .get(&id)
            .cloned()
            .or_else(|| self.shared.tables().entries.get(&id).cloned())
            .ok_or_else(|| LedgerError::not_found(Entity::Entry, id.get()))
    }

    async fn list_entries(
        &mut self,
        account_id: AccountId,
        page: Page,
    ) -> LedgerResult<Vec<Entry>> {
        self.shared.trip(StoreOp::ListEntries)?;
        let mut rows = self.shared.tables().entries.clone();
        rows.extend(self.entries.iter().map(|(id, e)| (*id, e.clone())));
        Ok(page.slice(rows.into_values().filter(|e| e.account_id == account_id)))
    }

    async fn create_transfer(&mut self, params: &CreateTransferParams) -> LedgerResult<Transfer> {
        self.shared.trip(StoreOp::CreateTransfer)?;
        for id in [params.from_account_id, params.to_account_id] {
            self.share_key(id).await?;
        }
        let transfer = Transfer {
            id: self.shared.tables().next_transfer_id(),
            from_account_id: params.from_account_id,
            to_account_id: params.to_account_id,
            amount: params.amount,
            created_at: Utc::now(),
        };
        self.transfers.insert(transfer.id, transfer.clone());
        Ok(transfer)
    }

    async fn get_transfer(&mut self, id: TransferId) -> LedgerResult<Transfer> {
        self.shared.trip(StoreOp::GetTransfer)?;
        self.transfers
            .get(&id)
            .cloned()
            .or_else(|| self.shared.tables().transfers.get(&id).cloned())
            .ok_or_else(|| LedgerError::not_found(Entity::Transfer, id.get()))
    }

    async fn list_transfers(
        &mut self,
        account_id: AccountId,
        page: Page,
    ) -> LedgerResult<Vec<Transfer>> {
        self.shared.trip(StoreOp::ListTransfers)?;
        let mut rows = self.shared.tables().transfers.clone();
        rows.extend(self.transfers.iter().map(|(id, t)| (*id, t.clone())));
        Ok(page.slice(
            rows.into_values()
                .filter(|t| t.from_account_id == account_id || t.to_account_id == account_id),
        ))
    }
}

#[async_trait]
impl LedgerTx for MemoryTx {
    async fn commit(mut self) -> LedgerResult<()> {
        // A failed commit leaves nothing behind, as with a database abort.
        self.shared.trip(StoreOp::Commit)?;

        let mut deleted = Vec::new();
        let mut tables = self.shared.tables();
        for (id, staged) in std::mem::take(&mut self.accounts) {
            match staged {
                Some(account) => {
                    tables.accounts.insert(id, account);
                }
                None => {
                    tables.accounts.remove(&id);
                    deleted.push(id);
                }
            }
        }
        tables.entries.append(&mut self.entries);
        tables.transfers.append(&mut self.transfers);
        drop(tables);

        // Locks are released only after the writes are published.
        self.held.clear();
        self.key_shares.clear();
        self.key_excl.clear();
        for id in deleted {
            self.shared.forget_locks(id);
        }
        Ok(())
    }

    async fn rollback(self) -> LedgerResult<()> {
        // Staged writes and row locks go away with `self` either way.
        self.shared.trip(StoreOp::Rollback)
    }
}
