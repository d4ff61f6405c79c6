//! Shared fixtures and transfer properties, run against every store.

#![allow(dead_code)]

use std::collections::HashSet;

use rand::Rng;
use rand::seq::SliceRandom;

use simple_bank::ledger::{
    Account, AccountId, CreateAccountParams, Currency, LedgerStore, Page,
};
use simple_bank::transfer::{BankService, TransferParams};

// ============================================================================
// Random fixtures
// ============================================================================

pub fn random_owner() -> String {
    let mut rng = rand::thread_rng();
    (0..6).map(|_| rng.gen_range(b'a'..=b'z') as char).collect()
}

pub fn random_money() -> i64 {
    rand::thread_rng().gen_range(0..=1000)
}

pub fn random_currency() -> Currency {
    *Currency::ALL
        .choose(&mut rand::thread_rng())
        .expect("currency list is not empty")
}

pub fn random_account_params() -> CreateAccountParams {
    CreateAccountParams {
        owner: random_owner(),
        balance: random_money(),
        currency: random_currency(),
    }
}

pub async fn create_account<S: LedgerStore>(svc: &BankService<S>, balance: i64) -> Account {
    svc.create_account(CreateAccountParams {
        balance,
        ..random_account_params()
    })
    .await
    .expect("create account")
}

pub async fn create_random_account<S: LedgerStore>(svc: &BankService<S>) -> Account {
    let params = random_account_params();
    let account = svc
        .create_account(params.clone())
        .await
        .expect("create account");

    assert_eq!(account.owner, params.owner);
    assert_eq!(account.balance, params.balance);
    assert_eq!(account.currency, params.currency);
    assert!(account.id.get() > 0);
    account
}

pub fn transfer_params(from: AccountId, to: AccountId, amount: i64) -> TransferParams {
    TransferParams {
        from_account_id: from,
        to_account_id: to,
        amount,
    }
}

pub async fn balance<S: LedgerStore>(svc: &BankService<S>, id: AccountId) -> i64 {
    svc.get_account(id).await.expect("get account").balance
}

// ============================================================================
// Properties
// ============================================================================

/// N concurrent transfers in one direction all commit, and every result
/// observes a distinct cumulative debit `k * amount`.
pub async fn check_concurrent_same_direction<S>(svc: BankService<S>, n: usize, amount: i64)
where
    S: LedgerStore + 'static,
{
    let from = create_account(&svc, 1_000).await;
    let to = create_account(&svc, 1_000).await;

    let handles: Vec<_> = (0..n)
        .map(|_| {
            let svc = svc.clone();
            let params = transfer_params(from.id, to.id, amount);
            tokio::spawn(async move { svc.transfer_money(params).await })
        })
        .collect();

    let mut seen = HashSet::new();
    for handle in handles {
        let result = handle.await.expect("task panicked").expect("transfer");

        assert_eq!(result.transfer.from_account_id, from.id);
        assert_eq!(result.transfer.to_account_id, to.id);
        assert_eq!(result.transfer.amount, amount);
        assert_eq!(result.from_entry.account_id, from.id);
        assert_eq!(result.from_entry.amount, -amount);
        assert_eq!(result.to_entry.account_id, to.id);
        assert_eq!(result.to_entry.amount, amount);

        svc.get_transfer(result.transfer.id).await.expect("transfer row");
        svc.get_entry(result.from_entry.id).await.expect("from entry row");
        svc.get_entry(result.to_entry.id).await.expect("to entry row");

        let debited = from.balance - result.from_account.balance;
        let credited = result.to_account.balance - to.balance;
        assert_eq!(debited, credited);
        assert!(debited > 0);
        assert_eq!(debited % amount, 0);

        let k = (debited / amount) as usize;
        assert!((1..=n).contains(&k));
        assert!(seen.insert(k), "increment {} observed twice", k);
    }

    let shifted = n as i64 * amount;
    assert_eq!(balance(&svc, from.id).await, from.balance - shifted);
    assert_eq!(balance(&svc, to.id).await, to.balance + shifted);
}

/// Transfers between one pair in alternating directions never deadlock.
pub async fn check_concurrent_alternating<S>(svc: BankService<S>, n: usize, amount: i64)
where
    S: LedgerStore + 'static,
{
    assert_eq!(n % 2, 0);
    let a = create_account(&svc, 500).await;
    let b = create_account(&svc, 500).await;

    let handles: Vec<_> = (0..n)
        .map(|i| {
            let svc = svc.clone();
            let params = if i % 2 == 0 {
                transfer_params(a.id, b.id, amount)
            } else {
                transfer_params(b.id, a.id, amount)
            };
            tokio::spawn(async move { svc.transfer_money(params).await })
        })
        .collect();

    for handle in handles {
        handle.await.expect("task panicked").expect("transfer");
    }

    assert_eq!(balance(&svc, a.id).await, a.balance);
    assert_eq!(balance(&svc, b.id).await, b.balance);
}

/// Money is neither created nor destroyed by a batch of random transfers.
pub async fn check_balance_conservation<S>(svc: BankService<S>, rounds: usize)
where
    S: LedgerStore + 'static,
{
    let mut accounts = Vec::new();
    for _ in 0..4 {
        accounts.push(create_random_account(&svc).await);
    }
    let total: i64 = accounts.iter().map(|a| a.balance).sum();

    let handles: Vec<_> = (0..rounds)
        .map(|_| {
            let mut rng = rand::thread_rng();
            let from = accounts[rng.gen_range(0..accounts.len())].id;
            let to = accounts[rng.gen_range(0..accounts.len())].id;
            let params = transfer_params(from, to, rng.gen_range(1..=50));
            let svc = svc.clone();
            tokio::spawn(async move { svc.transfer_money(params).await })
        })
        .collect();

    for handle in handles {
        handle.await.expect("task panicked").expect("transfer");
    }

    let mut after = 0;
    for account in &accounts {
        after += balance(&svc, account.id).await;
        let entries = svc
            .list_entries(account.id, Page::all())
            .await
            .expect("entries");
        let net: i64 = entries.iter().map(|e| e.amount).sum();
        assert_eq!(account.balance + net, balance(&svc, account.id).await);
    }
    assert_eq!(after, total);
}
