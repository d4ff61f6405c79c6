//! PostgreSQL Ledger Store
//!
//! Every query runs on the connection owned by an open [`PgTx`]. Row locks
//! are PostgreSQL row locks: `SELECT ... FOR NO KEY UPDATE` for explicit
//! reads, and the implicit lock taken by `UPDATE` for balance writes.
//! `FOR NO KEY UPDATE` does not conflict with the `FOR KEY SHARE` lock taken
//! by foreign-key checks, so inserting entries never waits on a balance lock.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use sqlx::{Postgres, Transaction};

use crate::db::Database;

use super::error::{Entity, LedgerError, LedgerResult};
use super::models::{
    Account, AccountId, CreateAccountParams, CreateTransferParams, Currency, Entry, EntryId, Page,
    Transfer, TransferId,
};
use super::store::{LedgerQueries, LedgerStore, LedgerTx};

/// PostgreSQL-backed ledger.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(db: &Database) -> Self {
        Self::from_pool(db.pool().clone())
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LedgerStore for PgStore {
    type Tx = PgTx;

    async fn begin(&self) -> LedgerResult<PgTx> {
        let tx = self.pool.begin().await?;
        Ok(PgTx { tx })
    }
}

/// An open PostgreSQL transaction (default READ COMMITTED isolation).
pub struct PgTx {
    tx: Transaction<'static, Postgres>,
}

/// Map a foreign-key violation on an insert to `NotFound` for the account
/// the violated constraint points at.
fn map_missing_account(e: sqlx::Error, candidates: &[(&str, AccountId)]) -> LedgerError {
    if let sqlx::Error::Database(db) = &e
        && db.is_foreign_key_violation()
    {
        let constraint = db.constraint().unwrap_or_default();
        let id = candidates
            .iter()
            .find(|(column, _)| constraint.contains(column))
            .or_else(|| candidates.first())
            .map(|(_, id)| *id);
        if let Some(id) = id {
            return LedgerError::account_not_found(id);
        }
    }
    e.into()
}

const ACCOUNT_COLUMNS: &str = "id, owner, balance, currency, created_at";
const ENTRY_COLUMNS: &str = "id, account_id, amount, created_at";
const TRANSFER_COLUMNS: &str = "id, from_account_id, to_account_id, amount, created_at";

#[async_trait]
impl LedgerQueries for PgTx {
    async fn create_account(&mut self, params: &CreateAccountParams) -> LedgerResult<Account> {
        let row = sqlx::query_as::<_, AccountRow>(&format!(
            "INSERT INTO accounts (owner, balance, currency) VALUES ($1, $2, $3) RETURNING {}",
            ACCOUNT_COLUMNS
        ))
        .bind(&params.owner)
        .bind(params.balance)
        .bind(params.currency.as_str())
        .fetch_one(&mut *self.tx)
        .await?;

        row.into_account()
    }

    async fn get_account(&mut self, id: AccountId) -> LedgerResult<Account> {
        let row = sqlx::query_as::<_, AccountRow>(&format!(
            "SELECT {} FROM accounts WHERE id = $1",
            ACCOUNT_COLUMNS
        ))
        .bind(id.get())
        .fetch_optional(&mut *self.tx)
        .await?;

        row.ok_or_else(|| LedgerError::account_not_found(id))?
            .into_account()
    }

    async fn get_account_for_update(&mut self, id: AccountId) -> LedgerResult<Account> {
        let row = sqlx::query_as::<_, AccountRow>(&format!(
            "SELECT {} FROM accounts WHERE id = $1 FOR NO KEY UPDATE",
            ACCOUNT_COLUMNS
        ))
        .bind(id.get())
        .fetch_optional(&mut *self.tx)
        .await?;

        row.ok_or_else(|| LedgerError::account_not_found(id))?
            .into_account()
    }

    async fn list_accounts(&mut self, page: Page) -> LedgerResult<Vec<Account>> {
        let rows = sqlx::query_as::<_, AccountRow>(&format!(
            "SELECT {} FROM accounts ORDER BY id LIMIT $1 OFFSET $2",
            ACCOUNT_COLUMNS
        ))
        .bind(page.limit)
        .bind(page.offset)
        .fetch_all(&mut *self.tx)
        .await?;

        rows.into_iter().map(AccountRow::into_account).collect()
    }

    async fn update_account_balance(
        &mut self,
        id: AccountId,
        balance: i64,
    ) -> LedgerResult<Account> {
        let row = sqlx::query_as::<_, AccountRow>(&format!(
            "UPDATE accounts SET balance = $2 WHERE id = $1 RETURNING {}",
            ACCOUNT_COLUMNS
        ))
        .bind(id.get())
        .bind(balance)
        .fetch_optional(&mut *self.tx)
        .await?;

        row.ok_or_else(|| LedgerError::account_not_found(id))?
            .into_account()
    }

    async fn add_account_balance(&mut self, id: AccountId, delta: i64) -> LedgerResult<Account> {
        let row = sqlx::query_as::<_, AccountRow>(&format!(
            "UPDATE accounts SET balance = balance + $2 WHERE id = $1 RETURNING {}",
            ACCOUNT_COLUMNS
        ))
        .bind(id.get())
        .bind(delta)
        .fetch_optional(&mut *self.tx)
        .await?;

        row.ok_or_else(|| LedgerError::account_not_found(id))?
            .into_account()
    }

    async fn delete_account(&mut self, id: AccountId) -> LedgerResult<()> {
        let result = sqlx::query("DELETE FROM accounts WHERE id = $1")
            .bind(id.get())
            .execute(&mut *self.tx)
            .await?;

        if result.rows_affected() == 0 {
            return Err(LedgerError::account_not_found(id));
        }
        Ok(())
    }

    async fn create_entry(&mut self, account_id: AccountId, amount: i64) -> LedgerResult<Entry> {
        let row = sqlx::query_as::<_, EntryRow>(&format!(
            "INSERT INTO entries (account_id, amount) VALUES ($1, $2) RETURNING {}",
            ENTRY_COLUMNS
        ))
        .bind(account_id.get())
        .bind(amount)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| map_missing_account(e, &[("account_id", account_id)]))?;

        Ok(row.into())
    }

    async fn get_entry(&mut self, id: EntryId) -> LedgerResult<Entry> {
        let row = sqlx::query_as::<_, EntryRow>(&format!(
            "SELECT {} FROM entries WHERE id = $1",
            ENTRY_COLUMNS
        ))
        .bind(id.get())
        .fetch_optional(&mut *self.tx)
        .await?;

        row.map(Entry::from)
            .ok_or_else(|| LedgerError::not_found(Entity::Entry, id.get()))
    }

    async fn list_entries(
        &mut self,
        account_id: AccountId,
        page: Page,
    ) -> LedgerResult<Vec<Entry>> {
        let rows = sqlx::query_as::<_, EntryRow>(&format!(
            "SELECT {} FROM entries WHERE account_id = $1 ORDER BY id LIMIT $2 OFFSET $3",
            ENTRY_COLUMNS
        ))
        .bind(account_id.get())
        .bind(page.limit)
        .bind(page.offset)
        .fetch_all(&mut *self.tx)
        .await?;

        Ok(rows.into_iter().map(Entry::from).collect())
    }

    async fn create_transfer(&mut self, params: &CreateTransferParams) -> LedgerResult<Transfer> {
        let row = sqlx::query_as::<_, TransferRow>(&format!(
            "INSERT INTO transfers (from_account_id, to_account_id, amount) \
             VALUES ($1, $2, $3) RETURNING {}",
            TRANSFER_COLUMNS
        ))
        .bind(params.from_account_id.get())
        .bind(params.to_account_id.get())
        .bind(params.amount)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| {
            map_missing_account(
                e,
                &[
                    ("from_account_id", params.from_account_id),
                    ("to_account_id", params.to_account_id),
                ],
            )
        })?;

        Ok(row.into())
    }

    async fn get_transfer(&mut self, id: TransferId) -> LedgerResult<Transfer> {
        let row = sqlx::query_as::<_, TransferRow>(&format!(
            "SELECT {} FROM transfers WHERE id = $1",
            TRANSFER_COLUMNS
        ))
        .bind(id.get())
        .fetch_optional(&mut *self.tx)
        .await?;

        row.map(Transfer::from)
            .ok_or_else(|| LedgerError::not_found(Entity::Transfer, id.get()))
    }

    async fn list_transfers(
        &mut self,
        account_id: AccountId,
        page: Page,
    ) -> LedgerResult<Vec<Transfer>> {
        let rows = sqlx::query_as::<_, TransferRow>(&format!(
            "SELECT {} FROM transfers \
             WHERE from_account_id = $1 OR to_account_id = $1 \
             ORDER BY id LIMIT $2 OFFSET $3",
            TRANSFER_COLUMNS
        ))
        .bind(account_id.get())
        .bind(page.limit)
        .bind(page.offset)
        .fetch_all(&mut *self.tx)
        .await?;

        Ok(rows.into_iter().map(Transfer::from).collect())
    }
}

#[async_trait]
impl LedgerTx for PgTx {
    async fn commit(self) -> LedgerResult<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self) -> LedgerResult<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

// ============================================================================
// Row Mapping
// ============================================================================

#[derive(sqlx::FromRow)]
struct AccountRow {
    id: i64,
    owner: String,
    balance: i64,
    currency: String,
    created_at: DateTime<Utc>,
}

impl AccountRow {
    fn into_account(self) -> LedgerResult<Account> {
        let currency = self.currency.parse::<Currency>().map_err(|e| {
            LedgerError::Store(format!("account {}: {}", self.id, e))
        })?;
        Ok(Account {
            id: AccountId(self.id),
            owner: self.owner,
            balance: self.balance,
            currency,
            created_at: self.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct EntryRow {
    id: i64,
    account_id: i64,
    amount: i64,
    created_at: DateTime<Utc>,
}

impl From<EntryRow> for Entry {
    fn from(row: EntryRow) -> Self {
        Entry {
            id: EntryId(row.id),
            account_id: AccountId(row.account_id),
            amount: row.amount,
            created_at: row.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct TransferRow {
    id: i64,
    from_account_id: i64,
    to_account_id: i64,
    amount: i64,
    created_at: DateTime<Utc>,
}

impl From<TransferRow> for Transfer {
    fn from(row: TransferRow) -> Self {
        Transfer {
            id: TransferId(row.id),
            from_account_id: AccountId(row.from_account_id),
            to_account_id: AccountId(row.to_account_id),
            amount: row.amount,
            created_at: row.created_at,
        }
    }
}
