//! Transfer result returned to callers.

use serde::{Deserialize, Serialize};

use crate::ledger::{Account, Entry, Transfer};

/// Everything a committed transfer produced: the transfer row, both entries,
/// and both accounts as updated by it.
///
/// For a self-transfer `from_account` and `to_account` are the same row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferResult {
    pub transfer: Transfer,
    pub from_account: Account,
    pub to_account: Account,
    pub from_entry: Entry,
    pub to_entry: Entry,
}

impl TransferResult {
    pub fn assemble(
        transfer: Transfer,
        from_account: Account,
        to_account: Account,
        from_entry: Entry,
        to_entry: Entry,
    ) -> Self {
        Self {
            transfer,
            from_account,
            to_account,
            from_entry,
            to_entry,
        }
    }
}
