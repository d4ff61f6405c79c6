//! Transfer Policies
//!
//! Retry behaviour for conflict aborts and the overdraft rule applied after
//! the engine ran.

use std::time::Duration;

use rand::Rng;

use crate::config::TransferConfig;
use crate::ledger::{LedgerError, LedgerResult};

use super::result::TransferResult;

// ============================================================================
// Retry
// ============================================================================

/// How often and how patiently a conflicted transfer is re-run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one. At least 1.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// A policy that runs the work once.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Delay before retry number `retry` (1-based).
    ///
    /// Doubles per retry up to `max_backoff`, then picks uniformly from the
    /// upper half of that window.
    pub fn backoff(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(16);
        let ceiling = self
            .initial_backoff
            .saturating_mul(1u32 << exp)
            .min(self.max_backoff);

        let ceiling_ms = ceiling.as_millis() as u64;
        if ceiling_ms < 2 {
            return ceiling;
        }
        let jittered = rand::thread_rng().gen_range(ceiling_ms / 2..=ceiling_ms);
        Duration::from_millis(jittered)
    }
}

// ============================================================================
// Overdraft
// ============================================================================

/// Whether a transfer may leave the source account below zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverdraftPolicy {
    #[default]
    Allow,
    Reject,
}

impl OverdraftPolicy {
    /// Check the debited account as updated by the transfer.
    pub fn check(&self, result: &TransferResult) -> LedgerResult<()> {
        let from = &result.from_account;
        match self {
            OverdraftPolicy::Reject if from.balance < 0 => Err(LedgerError::InsufficientFunds {
                account_id: from.id,
                balance: from.balance,
                amount: result.transfer.amount,
            }),
            _ => Ok(()),
        }
    }
}

/// Combined policy used by the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransferPolicy {
    pub retry: RetryPolicy,
    pub overdraft: OverdraftPolicy,
}

impl From<&TransferConfig> for TransferPolicy {
    fn from(cfg: &TransferConfig) -> Self {
        Self {
            retry: RetryPolicy {
                max_attempts: cfg.max_attempts.max(1),
                initial_backoff: Duration::from_millis(cfg.initial_backoff_ms),
                max_backoff: Duration::from_millis(cfg.max_backoff_ms),
            },
            overdraft: if cfg.allow_overdraft {
                OverdraftPolicy::Allow
            } else {
                OverdraftPolicy::Reject
            },
        }
    }
}
