use clap::Parser;
use fundsflow::application::engine::TransferEngine;
use fundsflow::config::EngineConfig;
use fundsflow::domain::account::AccountBalance;
use fundsflow::domain::ports::{LedgerStoreBox, TransferStoreBox};
use fundsflow::domain::transfer::{Transfer, TransferRequest};
use fundsflow::error::EngineError;
use fundsflow::infrastructure::in_memory::{InMemoryLedgerStore, InMemoryTransferStore};
use fundsflow::interfaces::csv::account_reader::AccountReader;
use fundsflow::interfaces::csv::account_writer::AccountWriter;
use fundsflow::interfaces::csv::transfer_reader::TransferReader;
use fundsflow::interfaces::csv::transfer_writer::TransferWriter;
use fundsflow::logging::init_logging;
use miette::{IntoDiagnostic, Result};
use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{info, warn};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Input transfers CSV file
    input: PathBuf,

    /// Opening balances CSV file (account, balance, currency[, owner])
    #[arg(long)]
    accounts: PathBuf,

    /// Path to persistent database (optional). If provided, uses RocksDB.
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// JSON engine configuration
    #[arg(long)]
    config: Option<PathBuf>,

    /// Overrides the configured account lock timeout
    #[arg(long)]
    lock_timeout_ms: Option<u64>,

    /// Overrides the configured log level
    #[arg(long)]
    log_level: Option<String>,

    /// Submit all transfers concurrently instead of in file order
    #[arg(long)]
    parallel: bool,

    /// Write one outcome row per transfer to this file
    #[arg(long)]
    transfers_out: Option<PathBuf>,
}

#[cfg(feature = "storage-rocksdb")]
fn open_stores(db_path: Option<PathBuf>) -> Result<(LedgerStoreBox, TransferStoreBox)> {
    use fundsflow::infrastructure::rocksdb::RocksDBStore;

    if let Some(db_path) = db_path {
        let store = RocksDBStore::open(db_path).into_diagnostic()?;
        return Ok((Box::new(store.clone()), Box::new(store)));
    }
    Ok(in_memory_stores())
}

#[cfg(not(feature = "storage-rocksdb"))]
fn open_stores(db_path: Option<PathBuf>) -> Result<(LedgerStoreBox, TransferStoreBox)> {
    if let Some(db_path) = db_path {
        warn!(
            path = %db_path.display(),
            "Built without RocksDB support. Falling back to in-memory storage."
        );
    }
    Ok(in_memory_stores())
}

fn in_memory_stores() -> (LedgerStoreBox, TransferStoreBox) {
    (
        Box::new(InMemoryLedgerStore::new()),
        Box::new(InMemoryTransferStore::new()),
    )
}

async fn provision(engine: &TransferEngine, path: PathBuf) -> Result<()> {
    let file = File::open(path).into_diagnostic()?;
    for row in AccountReader::new(file).accounts() {
        let account = match row {
            Ok(account) => account,
            Err(e) => {
                warn!(error = %e, "Error reading account");
                continue;
            }
        };
        match engine.open_account(account).await {
            Ok(()) => {}
            Err(EngineError::AccountExists(id)) => {
                warn!(account = %id, "Account already exists, keeping stored balance");
            }
            Err(EngineError::ValidationError(reason)) => {
                warn!(error = %reason, "Error reading account");
            }
            Err(e) => return Err(e).into_diagnostic(),
        }
    }
    Ok(())
}

async fn submit_all(
    engine: Arc<TransferEngine>,
    requests: Vec<TransferRequest>,
    parallel: bool,
) -> Vec<Transfer> {
    let mut outcomes = Vec::with_capacity(requests.len());

    if parallel {
        let mut tasks = JoinSet::new();
        for (line, request) in requests.into_iter().enumerate() {
            let engine = Arc::clone(&engine);
            tasks.spawn(async move { (line, submit_one(&engine, request).await) });
        }
        let mut finished = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((line, Some(transfer))) => finished.push((line, transfer)),
                Ok((_, None)) => {}
                Err(e) => warn!(error = %e, "Transfer task panicked"),
            }
        }
        finished.sort_by_key(|(line, _)| *line);
        outcomes.extend(finished.into_iter().map(|(_, t)| t));
    } else {
        for request in requests {
            if let Some(transfer) = submit_one(&engine, request).await {
                outcomes.push(transfer);
            }
        }
    }
    outcomes
}

async fn submit_one(engine: &TransferEngine, request: TransferRequest) -> Option<Transfer> {
    let outcome = match engine.submit(request).await {
        Ok(receipt) => engine.transfer(receipt.transfer_id).await,
        Err(e) => Err(e),
    };
    match outcome {
        Ok(transfer) => Some(transfer),
        Err(e) => {
            warn!(error = %e, "Error processing transfer");
            None
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => EngineConfig::from_file(path).into_diagnostic()?,
        None => EngineConfig::default(),
    };
    if let Some(ms) = cli.lock_timeout_ms {
        config.lock_timeout_ms = ms;
    }
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }
    init_logging(&config.log_level);

    let (ledger, transfers) = open_stores(cli.db_path)?;
    let engine = Arc::new(TransferEngine::with_config(ledger, transfers, config));

    let settled = engine.reconcile().await.into_diagnostic()?;
    if settled > 0 {
        info!(settled, "Settled transfers interrupted by an earlier run");
    }

    provision(&engine, cli.accounts).await?;

    let file = File::open(cli.input).into_diagnostic()?;
    let mut requests = Vec::new();
    for row in TransferReader::new(file).requests() {
        match row {
            Ok(request) => requests.push(request),
            Err(e) => warn!(error = %e, "Error reading transfer request"),
        }
    }

    let outcomes = submit_all(Arc::clone(&engine), requests, cli.parallel).await;
    info!(processed = outcomes.len(), "Batch finished");

    let audit = engine.audit().await.into_diagnostic()?;
    if !audit.is_clean() {
        warn!(violations = audit.violations.len(), "Ledger audit reported violations");
    }

    let mut balances: Vec<AccountBalance> = engine
        .accounts()
        .await
        .into_diagnostic()?
        .iter()
        .map(AccountBalance::from)
        .collect();
    balances.sort_by(|a, b| a.account.cmp(&b.account));

    let stdout = io::stdout();
    let mut writer = AccountWriter::new(stdout.lock());
    writer.write_accounts(balances).into_diagnostic()?;

    if let Some(path) = cli.transfers_out {
        let file = File::create(path).into_diagnostic()?;
        TransferWriter::new(file)
            .write_transfers(&outcomes)
            .into_diagnostic()?;
    }

    Ok(())
}
