//! simple_bank - command line front end
//!
//! ```text
//! simple_bank [--env <name>] <command> [args]
//!
//!   create-account <owner> <currency>
//!   get-account <id>
//!   list-accounts [page_id] [page_size]
//!   transfer <from> <to> <amount> [--timeout-ms N]
//!   entries <account_id>
//!   transfers <account_id>
//!   health
//! ```
//!
//! Results are printed to stdout as JSON. Ledger errors are reported with
//! their error code.

use std::time::Duration;

use anyhow::{Context, anyhow, bail};
use serde::Serialize;
use tokio::time::Instant;

use simple_bank::config::AppConfig;
use simple_bank::db::Database;
use simple_bank::ledger::{AccountId, CreateAccountParams, Currency, LedgerError, Page, PgStore};
use simple_bank::transfer::{BankService, TransferParams, TransferPolicy};

// ============================================================
// ARGUMENTS
// ============================================================

fn get_env(args: &[String]) -> String {
    for i in 0..args.len() {
        if (args[i] == "--env" || args[i] == "-e") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }
    "dev".to_string()
}

fn get_timeout_ms(args: &[String]) -> anyhow::Result<Option<u64>> {
    for i in 0..args.len() {
        if args[i] == "--timeout-ms" {
            let value = args
                .get(i + 1)
                .ok_or_else(|| anyhow!("--timeout-ms needs a value"))?;
            return Ok(Some(value.parse::<u64>().context("invalid --timeout-ms")?));
        }
    }
    Ok(None)
}

/// Positional arguments with flags and their values removed.
fn positional(args: &[String]) -> Vec<String> {
    let mut out = Vec::new();
    let mut skip = false;
    for arg in args.iter().skip(1) {
        if skip {
            skip = false;
            continue;
        }
        match arg.as_str() {
            "--env" | "-e" | "--timeout-ms" => skip = true,
            _ => out.push(arg.clone()),
        }
    }
    out
}

#[derive(Debug, PartialEq)]
enum Command {
    CreateAccount { owner: String, currency: Currency },
    GetAccount(AccountId),
    ListAccounts(Page),
    Transfer {
        params: TransferParams,
        timeout: Option<Duration>,
    },
    Entries(AccountId),
    Transfers(AccountId),
    Health,
}

fn arg<'a>(pos: &'a [String], i: usize, name: &str) -> anyhow::Result<&'a str> {
    pos.get(i)
        .map(String::as_str)
        .ok_or_else(|| anyhow!("missing argument <{}>", name))
}

fn account_arg(pos: &[String], i: usize, name: &str) -> anyhow::Result<AccountId> {
    let raw = arg(pos, i, name)?;
    let id = raw
        .parse::<i64>()
        .with_context(|| format!("invalid <{}>: {}", name, raw))?;
    Ok(AccountId(id))
}

fn parse_command(args: &[String]) -> anyhow::Result<Command> {
    let pos = positional(args);
    let Some(name) = pos.first() else {
        bail!("missing command");
    };

    let cmd = match name.as_str() {
        "create-account" => Command::CreateAccount {
            owner: arg(&pos, 1, "owner")?.to_string(),
            currency: arg(&pos, 2, "currency")?
                .parse::<Currency>()
                .map_err(|e| anyhow!(e))?,
        },
        "get-account" => Command::GetAccount(account_arg(&pos, 1, "id")?),
        "list-accounts" => {
            let page_id = pos.get(1).map(|s| s.parse::<i64>()).transpose()?.unwrap_or(1);
            let page_size = pos.get(2).map(|s| s.parse::<i64>()).transpose()?.unwrap_or(10);
            Command::ListAccounts(Page::new(page_id, page_size))
        }
        "transfer" => Command::Transfer {
            params: TransferParams {
                from_account_id: account_arg(&pos, 1, "from")?,
                to_account_id: account_arg(&pos, 2, "to")?,
                amount: arg(&pos, 3, "amount")?.parse::<i64>().context("invalid <amount>")?,
            },
            timeout: get_timeout_ms(args)?.map(Duration::from_millis),
        },
        "entries" => Command::Entries(account_arg(&pos, 1, "account_id")?),
        "transfers" => Command::Transfers(account_arg(&pos, 1, "account_id")?),
        "health" => Command::Health,
        other => bail!("unknown command: {}", other),
    };
    Ok(cmd)
}

// ============================================================
// EXECUTION
// ============================================================

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn ledger_failure(e: LedgerError) -> anyhow::Error {
    tracing::error!(code = e.code(), error = %e, "Command failed");
    anyhow!("{}: {}", e.code(), e)
}

async fn run(cmd: Command, db: &Database, svc: &BankService<PgStore>) -> anyhow::Result<()> {
    match cmd {
        Command::CreateAccount { owner, currency } => {
            let account = svc
                .create_account(CreateAccountParams {
                    owner,
                    balance: 0,
                    currency,
                })
                .await
                .map_err(ledger_failure)?;
            print_json(&account)
        }
        Command::GetAccount(id) => print_json(&svc.get_account(id).await.map_err(ledger_failure)?),
        Command::ListAccounts(page) => {
            print_json(&svc.list_accounts(page).await.map_err(ledger_failure)?)
        }
        Command::Transfer { params, timeout } => {
            let deadline = timeout.map(|t| Instant::now() + t);
            let result = svc
                .transfer_money_until(params, deadline)
                .await
                .map_err(ledger_failure)?;
            print_json(&result)
        }
        Command::Entries(id) => print_json(
            &svc.list_entries(id, Page::all())
                .await
                .map_err(ledger_failure)?,
        ),
        Command::Transfers(id) => print_json(
            &svc.list_transfers(id, Page::all())
                .await
                .map_err(ledger_failure)?,
        ),
        Command::Health => {
            db.health_check().await.context("database health check failed")?;
            print_json(&serde_json::json!({ "status": "ok" }))
        }
    }
}

// ============================================================
// MAIN
// ============================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let cmd = parse_command(&args)?;

    let env = get_env(&args);
    let app_config = AppConfig::load(&env)?;
    let _log_guard = simple_bank::logging::init_logging(&app_config);

    tracing::info!(env = %env, command = ?cmd, "Starting simple_bank");

    let db = Database::connect(&app_config.database)
        .await
        .context("failed to connect to PostgreSQL")?;
    let svc = BankService::new(
        PgStore::new(&db),
        TransferPolicy::from(&app_config.transfer),
    );

    let outcome = run(cmd, &db, &svc).await;
    db.close().await;
    outcome
}
