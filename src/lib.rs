//! simple_bank - Transactional Funds Transfer Engine
//!
//! Accounts, an append-only ledger of entries, and transfers that move money
//! between two accounts atomically under concurrent load.
//!
//! # Modules
//!
//! - [`ledger`] - Row types, store ports, PostgreSQL and in-memory stores,
//!   and the transaction coordinator
//! - [`transfer`] - Transfer engine, retry and overdraft policies, `BankService`
//! - [`config`] - YAML application config
//! - [`db`] - PostgreSQL connection pool
//! - [`logging`] - tracing subscriber setup

pub mod config;
pub mod db;
pub mod ledger;
pub mod logging;
pub mod transfer;

// Convenient re-exports at crate root
pub use ledger::{
    Account, AccountId, Currency, Entry, EntryId, LedgerError, LedgerResult, LedgerStore,
    MemoryStore, PgStore, Transfer, TransferId,
};
pub use transfer::{BankService, TransferParams, TransferPolicy, TransferResult};
