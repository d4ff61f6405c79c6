//! Transfer behaviour against the in-memory store.

mod common;

use std::time::Duration;

use tokio::time::Instant;

use simple_bank::ledger::{
    AccountId, FaultKind, LedgerError, LedgerQueries, LedgerStore, LedgerTx, MemoryStore, Page,
    StoreOp,
};
use simple_bank::transfer::{BankService, OverdraftPolicy, RetryPolicy, TransferPolicy};

use common::{create_account, transfer_params};

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 4,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(5),
    }
}

fn service(store: &MemoryStore) -> BankService<MemoryStore> {
    BankService::new(
        store.clone(),
        TransferPolicy {
            retry: fast_retry(),
            overdraft: OverdraftPolicy::Allow,
        },
    )
}

// ============================================================================
// Single transfers
// ============================================================================

#[tokio::test]
async fn test_transfer_example() {
    let store = MemoryStore::new();
    let svc = service(&store);
    let a = create_account(&svc, 100).await;
    let b = create_account(&svc, 50).await;
    assert_eq!((a.id, b.id), (AccountId(1), AccountId(2)));

    let result = svc
        .transfer_money(transfer_params(a.id, b.id, 30))
        .await
        .unwrap();

    assert_eq!(result.from_account.balance, 70);
    assert_eq!(result.to_account.balance, 80);
    assert_eq!(store.account(a.id).unwrap().balance, 70);
    assert_eq!(store.account(b.id).unwrap().balance, 80);

    assert_eq!(result.transfer.amount, 30);
    assert_eq!(result.from_entry.amount, -30);
    assert_eq!(result.to_entry.amount, 30);
    assert_eq!(result.from_entry.amount, -result.to_entry.amount);
    assert_eq!(result.transfer.amount, result.to_entry.amount.abs());

    let counts = store.counts();
    assert_eq!(counts.transfers, 1);
    assert_eq!(counts.entries, 2);
}

#[tokio::test]
async fn test_reverse_direction_uses_same_lock_order() {
    let store = MemoryStore::new();
    let svc = service(&store);
    let a = create_account(&svc, 100).await;
    let b = create_account(&svc, 100).await;

    let result = svc
        .transfer_money(transfer_params(b.id, a.id, 25))
        .await
        .unwrap();

    assert_eq!(result.from_account.id, b.id);
    assert_eq!(result.from_account.balance, 75);
    assert_eq!(result.to_account.id, a.id);
    assert_eq!(result.to_account.balance, 125);
}

#[tokio::test]
async fn test_missing_source_account_is_not_found() {
    let store = MemoryStore::new();
    let svc = service(&store);
    let b = create_account(&svc, 50).await;

    let err = svc
        .transfer_money(transfer_params(AccountId(999), b.id, 10))
        .await
        .unwrap_err();

    assert_eq!(err, LedgerError::account_not_found(AccountId(999)));
    assert_eq!(err.http_status(), 404);
    assert_eq!(store.counts().transfers, 0);
    assert_eq!(store.counts().entries, 0);
    assert_eq!(store.account(b.id).unwrap().balance, 50);
}

#[tokio::test]
async fn test_missing_destination_account_is_not_found() {
    let store = MemoryStore::new();
    let svc = service(&store);
    let a = create_account(&svc, 50).await;

    let err = svc
        .transfer_money(transfer_params(a.id, AccountId(999), 10))
        .await
        .unwrap_err();

    assert!(err.is_not_found());
    assert_eq!(store.account(a.id).unwrap().balance, 50);
    assert_eq!(store.counts().transfers, 0);
}

#[tokio::test]
async fn test_failure_on_second_entry_leaves_nothing_behind() {
    let store = MemoryStore::new();
    let svc = service(&store);
    let a = create_account(&svc, 100).await;
    let b = create_account(&svc, 50).await;
    let before = store.counts();

    store.fail_on(StoreOp::CreateEntry, 2, FaultKind::Store);
    let err = svc
        .transfer_money(transfer_params(a.id, b.id, 30))
        .await
        .unwrap_err();

    assert!(matches!(err, LedgerError::Store(_)));
    assert_eq!(store.counts(), before);
    assert_eq!(store.account(a.id).unwrap().balance, 100);
    assert_eq!(store.account(b.id).unwrap().balance, 50);
}

#[tokio::test]
async fn test_failure_on_second_balance_update_rolls_back_first() {
    let store = MemoryStore::new();
    let svc = service(&store);
    let a = create_account(&svc, 100).await;
    let b = create_account(&svc, 50).await;

    store.fail_on(StoreOp::AddAccountBalance, 2, FaultKind::Store);
    svc.transfer_money(transfer_params(a.id, b.id, 30))
        .await
        .unwrap_err();

    assert_eq!(store.account(a.id).unwrap().balance, 100);
    assert_eq!(store.account(b.id).unwrap().balance, 50);
    assert_eq!(store.counts().entries, 0);
}

#[tokio::test]
async fn test_rollback_failure_is_reported() {
    let store = MemoryStore::new();
    let svc = service(&store);
    let a = create_account(&svc, 100).await;

    store.fail_on(StoreOp::Rollback, 1, FaultKind::Store);
    let err = svc
        .transfer_money(transfer_params(a.id, AccountId(404), 30))
        .await
        .unwrap_err();

    assert!(matches!(err, LedgerError::RollbackFailed(_)));
    assert_eq!(err.code(), "ROLLBACK_FAILED");
    assert_eq!(store.account(a.id).unwrap().balance, 100);
}

// ============================================================================
// Self-transfer
// ============================================================================

#[tokio::test]
async fn test_self_transfer_records_entries_without_moving_money() {
    let store = MemoryStore::new();
    let svc = service(&store);
    let a = create_account(&svc, 100).await;

    let result = svc
        .transfer_money(transfer_params(a.id, a.id, 40))
        .await
        .unwrap();

    assert_eq!(result.from_account, result.to_account);
    assert_eq!(result.from_account.balance, 100);
    assert_eq!(result.from_entry.amount, -40);
    assert_eq!(result.to_entry.amount, 40);

    let entries = svc.list_entries(a.id, Page::all()).await.unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(store.account(a.id).unwrap().balance, 100);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_self_transfers_do_not_deadlock() {
    let store = MemoryStore::with_lock_timeout(Duration::from_secs(5));
    let svc = service(&store);
    let a = create_account(&svc, 10).await;

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let svc = svc.clone();
            let params = transfer_params(a.id, a.id, 3);
            tokio::spawn(async move { svc.transfer_money(params).await })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(store.account(a.id).unwrap().balance, 10);
    assert_eq!(store.counts().entries, 16);
}

// ============================================================================
// Concurrency
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_same_direction_transfers() {
    let store = MemoryStore::new();
    common::check_concurrent_same_direction(service(&store), 5, 10).await;
    assert_eq!(store.counts().transfers, 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_alternating_transfers_do_not_deadlock() {
    // A lock cycle would surface as DeadlockDetected once retries run out.
    let store = MemoryStore::with_lock_timeout(Duration::from_secs(5));
    let svc = BankService::new(
        store.clone(),
        TransferPolicy {
            retry: RetryPolicy::no_retry(),
            overdraft: OverdraftPolicy::Allow,
        },
    );
    common::check_concurrent_alternating(svc, 10, 10).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_balance_conservation_under_random_load() {
    let store = MemoryStore::new();
    common::check_balance_conservation(service(&store), 40).await;
}

// ============================================================================
// Retries and deadlines
// ============================================================================

#[tokio::test]
async fn test_conflict_is_retried_from_the_first_step() {
    let store = MemoryStore::new();
    let svc = service(&store);
    let a = create_account(&svc, 100).await;
    let b = create_account(&svc, 0).await;

    store.fail_on(StoreOp::CreateEntry, 2, FaultKind::SerializationFailure);
    let result = svc
        .transfer_money(transfer_params(a.id, b.id, 10))
        .await
        .unwrap();

    assert_eq!(result.to_account.balance, 10);
    assert_eq!(store.counts().transfers, 1);
    assert_eq!(store.counts().entries, 2);
}

#[tokio::test]
async fn test_exhausted_retries_surface_as_store_error() {
    let store = MemoryStore::new();
    let svc = service(&store);
    let a = create_account(&svc, 100).await;
    let b = create_account(&svc, 0).await;

    for _ in 0..fast_retry().max_attempts {
        store.fail_on(StoreOp::AddAccountBalance, 1, FaultKind::DeadlockDetected);
    }
    let err = svc
        .transfer_money(transfer_params(a.id, b.id, 10))
        .await
        .unwrap_err();

    assert!(matches!(err, LedgerError::Store(ref msg) if msg.contains("after 4 attempts")));
    assert!(!err.is_retryable());
    assert_eq!(store.account(a.id).unwrap().balance, 100);
}

#[tokio::test]
async fn test_deadline_cancels_blocked_transfer() {
    let store = MemoryStore::new();
    let svc = service(&store);
    let a = create_account(&svc, 100).await;
    let b = create_account(&svc, 0).await;

    // another transaction holds the row lock on `a`
    let mut holder = store.begin().await.unwrap();
    holder.get_account_for_update(a.id).await.unwrap();

    let deadline = Instant::now() + Duration::from_millis(50);
    let err = svc
        .transfer_money_until(transfer_params(a.id, b.id, 10), Some(deadline))
        .await
        .unwrap_err();

    assert_eq!(err, LedgerError::Cancelled);
    assert_eq!(err.http_status(), 504);
    assert_eq!(store.counts().transfers, 0);

    holder.rollback().await.unwrap();

    // both rows are free again
    let result = svc
        .transfer_money(transfer_params(b.id, a.id, 5))
        .await
        .unwrap();
    assert_eq!(result.from_account.balance, -5);
    assert_eq!(result.to_account.balance, 105);
}

#[tokio::test]
async fn test_deadline_shorter_than_backoff_cancels() {
    let store = MemoryStore::new();
    let svc = BankService::new(
        store.clone(),
        TransferPolicy {
            retry: RetryPolicy {
                max_attempts: 5,
                initial_backoff: Duration::from_secs(10),
                max_backoff: Duration::from_secs(10),
            },
            overdraft: OverdraftPolicy::Allow,
        },
    );
    let a = create_account(&svc, 100).await;
    let b = create_account(&svc, 0).await;

    store.fail_on(StoreOp::Commit, 1, FaultKind::DeadlockDetected);
    let started = Instant::now();
    let err = svc
        .transfer_money_until(
            transfer_params(a.id, b.id, 10),
            Some(started + Duration::from_millis(200)),
        )
        .await
        .unwrap_err();

    assert_eq!(err, LedgerError::Cancelled);
    assert!(started.elapsed() < Duration::from_secs(5));
}

// ============================================================================
// Policies and validation
// ============================================================================

#[tokio::test]
async fn test_non_positive_amounts_are_rejected() {
    let store = MemoryStore::new();
    let svc = service(&store);
    let a = create_account(&svc, 100).await;
    let b = create_account(&svc, 100).await;

    for amount in [0, -10] {
        let err = svc
            .transfer_money(transfer_params(a.id, b.id, amount))
            .await
            .unwrap_err();
        assert_eq!(err, LedgerError::InvalidAmount(amount));
    }
    assert_eq!(store.counts().transfers, 0);
}

#[tokio::test]
async fn test_overdraft_reject_rolls_back() {
    let store = MemoryStore::new();
    let svc = BankService::new(
        store.clone(),
        TransferPolicy {
            retry: fast_retry(),
            overdraft: OverdraftPolicy::Reject,
        },
    );
    let a = create_account(&svc, 20).await;
    let b = create_account(&svc, 0).await;

    let err = svc
        .transfer_money(transfer_params(a.id, b.id, 30))
        .await
        .unwrap_err();

    assert_eq!(
        err,
        LedgerError::InsufficientFunds {
            account_id: a.id,
            balance: -10,
            amount: 30,
        }
    );
    assert_eq!(store.account(a.id).unwrap().balance, 20);
    assert_eq!(store.account(b.id).unwrap().balance, 0);
    assert_eq!(store.counts().transfers, 0);
}

#[tokio::test]
async fn test_history_lists_both_sides() {
    let store = MemoryStore::new();
    let svc = service(&store);
    let a = create_account(&svc, 100).await;
    let b = create_account(&svc, 100).await;
    let c = create_account(&svc, 100).await;

    svc.transfer_money(transfer_params(a.id, b.id, 1)).await.unwrap();
    svc.transfer_money(transfer_params(b.id, c.id, 2)).await.unwrap();
    svc.transfer_money(transfer_params(c.id, a.id, 3)).await.unwrap();

    let transfers = svc.list_transfers(b.id, Page::all()).await.unwrap();
    assert_eq!(transfers.len(), 2);
    assert!(transfers.windows(2).all(|w| w[0].id < w[1].id));

    let first_page = svc.list_transfers(a.id, Page::new(1, 1)).await.unwrap();
    assert_eq!(first_page.len(), 1);
    assert_eq!(first_page[0].to_account_id, b.id);

    let entries = svc.list_entries(c.id, Page::all()).await.unwrap();
    let amounts: Vec<i64> = entries.iter().map(|e| e.amount).collect();
    assert_eq!(amounts, vec![2, -3]);
}
