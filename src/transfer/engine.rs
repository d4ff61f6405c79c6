//! Transfer Engine
//!
//! The unit of work for one money transfer. Runs against an already open
//! transaction and never commits or rolls back itself.
//!
//! # Steps
//!
//! 1. insert the transfer row
//! 2. insert the debit entry (`-amount`) for the source account
//! 3. insert the credit entry (`+amount`) for the destination account
//! 4. move the balances, locking accounts in ascending `AccountId` order
//!
//! Two transfers touching the same pair of accounts always request the row
//! locks in the same order, so they queue behind each other instead of
//! forming a lock cycle, whatever their directions.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::ledger::{Account, AccountId, CreateTransferParams, LedgerQueries, LedgerResult};

use super::result::TransferResult;

/// Input of a transfer. `amount` is in the smallest currency unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferParams {
    pub from_account_id: AccountId,
    pub to_account_id: AccountId,
    pub amount: i64,
}

impl From<TransferParams> for CreateTransferParams {
    fn from(p: TransferParams) -> Self {
        CreateTransferParams {
            from_account_id: p.from_account_id,
            to_account_id: p.to_account_id,
            amount: p.amount,
        }
    }
}

/// A balance change on one account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Leg {
    pub account_id: AccountId,
    pub delta: i64,
}

/// Order in which account rows are locked and updated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOrder {
    /// Source and destination are the same account.
    Single(AccountId),
    /// Two distinct accounts; `first.account_id < second.account_id`.
    Pair { first: Leg, second: Leg },
}

/// Lock order for a transfer: smaller account id first, regardless of direction.
pub fn lock_order(params: &TransferParams) -> LockOrder {
    let debit = Leg {
        account_id: params.from_account_id,
        delta: -params.amount,
    };
    let credit = Leg {
        account_id: params.to_account_id,
        delta: params.amount,
    };

    match params.from_account_id.cmp(&params.to_account_id) {
        std::cmp::Ordering::Equal => LockOrder::Single(params.from_account_id),
        std::cmp::Ordering::Less => LockOrder::Pair {
            first: debit,
            second: credit,
        },
        std::cmp::Ordering::Greater => LockOrder::Pair {
            first: credit,
            second: debit,
        },
    }
}

/// Execute one transfer inside the caller's transaction.
///
/// Any error leaves the transaction in a state that must be rolled back.
pub async fn transfer_tx<Q>(q: &mut Q, params: TransferParams) -> LedgerResult<TransferResult>
where
    Q: LedgerQueries + ?Sized,
{
    let transfer = q.create_transfer(&params.into()).await?;
    let from_entry = q
        .create_entry(params.from_account_id, -params.amount)
        .await?;
    let to_entry = q.create_entry(params.to_account_id, params.amount).await?;

    let (from_account, to_account) = move_balances(q, &params).await?;

    debug!(
        transfer_id = %transfer.id,
        from = %params.from_account_id,
        to = %params.to_account_id,
        amount = params.amount,
        "Transfer rows written"
    );

    Ok(TransferResult::assemble(
        transfer,
        from_account,
        to_account,
        from_entry,
        to_entry,
    ))
}

/// Apply both balance changes in lock order.
///
/// Returns `(from_account, to_account)` as updated.
async fn move_balances<Q>(q: &mut Q, params: &TransferParams) -> LedgerResult<(Account, Account)>
where
    Q: LedgerQueries + ?Sized,
{
    match lock_order(params) {
        LockOrder::Single(id) => {
            // Net delta is zero: lock once, write nothing.
            let account = q.get_account_for_update(id).await?;
            Ok((account.clone(), account))
        }
        LockOrder::Pair { first, second } => {
            let first_account = q.add_account_balance(first.account_id, first.delta).await?;
            let second_account = q
                .add_account_balance(second.account_id, second.delta)
                .await?;

            if first.account_id == params.from_account_id {
                Ok((first_account, second_account))
            } else {
                Ok((second_account, first_account))
            }
        }
    }
}
