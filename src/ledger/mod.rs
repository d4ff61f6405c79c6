//! Ledger Storage
//!
//! Accounts, entries and transfers, the store ports over them, and the
//! transaction coordinator that runs a unit of work with exactly one commit
//! or rollback.
//!
//! # Layout
//!
//! - [`models`] - row types and parameters
//! - [`error`] - the shared error taxonomy
//! - [`store`] - `LedgerQueries` / `LedgerTx` / `LedgerStore` ports
//! - [`tx`] - `run_in_transaction`
//! - [`postgres`] - PostgreSQL store
//! - [`memory`] - in-process store with the same locking semantics

pub mod error;
pub mod memory;
pub mod models;
pub mod postgres;
pub mod store;
pub mod tx;

pub use error::{Entity, LedgerError, LedgerResult};
pub use memory::{FaultKind, MemoryStore, MemoryTx, RowCounts, StoreOp};
pub use models::{
    Account, AccountId, CreateAccountParams, CreateTransferParams, Currency, Entry, EntryId, Page,
    Transfer, TransferId,
};
pub use postgres::{PgStore, PgTx};
pub use store::{LedgerQueries, LedgerStore, LedgerTx};
pub use tx::{run_in_transaction, run_in_transaction_until};
