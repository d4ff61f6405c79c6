//! Ledger Data Models
//!
//! Row shapes for the three ledger tables (`accounts`, `entries`, `transfers`)
//! plus the parameter types consumed by the store operations.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Identifiers
// ============================================================================

/// Account identifier.
///
/// Server-assigned and monotonic. The ordering of `AccountId` is the global
/// lock order used by the transfer engine, so it must stay total and stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(pub i64);

/// Entry identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(pub i64);

/// Transfer identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransferId(pub i64);

macro_rules! impl_id {
    ($($ty:ident),*) => {
        $(
            impl $ty {
                pub fn get(self) -> i64 {
                    self.0
                }
            }

            impl From<i64> for $ty {
                fn from(v: i64) -> Self {
                    Self(v)
                }
            }

            impl fmt::Display for $ty {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    write!(f, "{}", self.0)
                }
            }
        )*
    };
}

impl_id!(AccountId, EntryId, TransferId);

// ============================================================================
// Currency
// ============================================================================

/// Account currency, fixed at account creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    Usd,
    Eur,
}

impl Currency {
    pub const ALL: [Currency; 2] = [Currency::Usd, Currency::Eur];

    pub fn as_str(&self) -> &'static str {
        match self {
            Currency::Usd => "USD",
            Currency::Eur => "EUR",
        }
    }
}

impl FromStr for Currency {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "USD" => Ok(Currency::Usd),
            "EUR" => Ok(Currency::Eur),
            other => Err(format!("unsupported currency: {}", other)),
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Rows
// ============================================================================

/// A customer account. Only `balance` is ever mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub owner: String,
    /// Smallest currency unit (cents).
    pub balance: i64,
    pub currency: Currency,
    pub created_at: DateTime<Utc>,
}

/// One balance change applied to one account. Immutable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub id: EntryId,
    pub account_id: AccountId,
    /// Signed delta; negative for debits.
    pub amount: i64,
    pub created_at: DateTime<Utc>,
}

/// A recorded movement of funds between two accounts. Immutable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    pub id: TransferId,
    pub from_account_id: AccountId,
    pub to_account_id: AccountId,
    /// Always positive.
    pub amount: i64,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Parameters
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateAccountParams {
    pub owner: String,
    pub balance: i64,
    pub currency: Currency,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateTransferParams {
    pub from_account_id: AccountId,
    pub to_account_id: AccountId,
    pub amount: i64,
}

/// Limit/offset window for list queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub limit: i64,
    pub offset: i64,
}

impl Page {
    /// Build a window from a 1-based page number and a page size.
    pub fn new(page_id: i64, page_size: i64) -> Self {
        let page_id = page_id.max(1);
        let page_size = page_size.max(0);
        Self {
            limit: page_size,
            offset: (page_id - 1).saturating_mul(page_size),
        }
    }

    pub fn all() -> Self {
        Self {
            limit: i64::MAX,
            offset: 0,
        }
    }

    /// Apply the window to an already ordered iterator.
    pub fn slice<T>(&self, rows: impl Iterator<Item = T>) -> Vec<T> {
        rows.skip(self.offset.max(0) as usize)
            .take(self.limit.max(0) as usize)
            .collect()
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new(1, 10)
    }
}
