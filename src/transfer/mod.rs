//! Funds Transfer
//!
//! Moves money between two accounts as one atomic unit: one transfer row,
//! two opposite-signed entries, and two balance changes, all committed
//! together or not at all.
//!
//! # Layers
//!
//! - [`engine`] - the unit of work, run inside an open transaction
//! - [`result`] - the value returned to callers
//! - [`policy`] - retry and overdraft rules
//! - [`service`] - `BankService`, the caller-facing API

pub mod engine;
pub mod policy;
pub mod result;
pub mod service;

pub use engine::{Leg, LockOrder, TransferParams, lock_order, transfer_tx};
pub use policy::{OverdraftPolicy, RetryPolicy, TransferPolicy};
pub use result::TransferResult;
pub use service::BankService;
