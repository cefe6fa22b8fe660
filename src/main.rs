//! Query server entrypoint.
//!
//! `replaylens` serves the event-log query tools over stdio until it is shut
//! down; `replaylens --shutdown` signals a running server and exits.
//!
//! # Exit Codes
//!
//! - 0: Clean exit (server stopped, or `--shutdown` reached a server)
//! - 1: No server to signal, or another instance already holds the lock
//! - 2: Runtime error (database, I/O)

use anyhow::{Context, Result};
use clap::Parser;
use dotenv::dotenv;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use replaylens::coordination::{
    db_path::default_database_path, InstanceLock, ShutdownClient, ShutdownSignal,
};
use replaylens::query::QueryEngine;
use replaylens::server;
use replaylens::storage::EventStore;

#[derive(Debug, Parser)]
#[command(
    name = "replaylens",
    about = "Backtest event log query server (stdio tool protocol)"
)]
struct Cli {
    /// Database file to serve (overrides REPLAYLENS_DB and the default path).
    #[arg(long)]
    database: Option<PathBuf>,

    /// Signal a running server to shut down, then exit.
    #[arg(long)]
    shutdown: bool,
}

#[tokio::main]
async fn main() {
    dotenv().ok();
    // Protocol owns stdout; all diagnostics go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let db_path = default_database_path(cli.database.as_deref());
    let coord_dir = coordination_dir(&db_path);

    let code = if cli.shutdown {
        signal_shutdown(&coord_dir)
    } else {
        match serve(&db_path, &coord_dir).await {
            Ok(code) => code,
            Err(e) => {
                error!("Server failed: {:#}", e);
                2
            }
        }
    };
    std::process::exit(code);
}

/// Coordination files live next to the database so both processes find them.
fn coordination_dir(db_path: &Path) -> PathBuf {
    match db_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn signal_shutdown(coord_dir: &Path) -> i32 {
    match ShutdownClient::open_existing(coord_dir) {
        Some(client) => match client.signal() {
            Ok(()) => {
                info!("Shutdown signal sent");
                0
            }
            Err(e) => {
                error!("Failed to signal shutdown: {:#}", e);
                1
            }
        },
        None => {
            error!("No running query server to shut down");
            1
        }
    }
}

async fn serve(db_path: &Path, coord_dir: &Path) -> Result<i32> {
    let lock = match InstanceLock::try_acquire(coord_dir)? {
        Some(lock) => lock,
        None => {
            error!("Another query server instance is already running");
            return Ok(1);
        }
    };

    let signal = ShutdownSignal::create_for_server(coord_dir)?;
    let store = Arc::new(
        EventStore::open(db_path)
            .with_context(|| format!("Cannot serve database at {}", db_path.display()))?,
    );
    let engine = Arc::new(QueryEngine::new(store));

    // Ctrl-C maps onto the same cancellation token the shutdown wait races.
    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = cancel_tx.send(true);
        }
    });

    info!(database = %db_path.display(), "Serving event log queries");
    server::run_server(engine, signal, cancel_rx).await?;

    // Lock released here on every path.
    drop(lock);
    Ok(0)
}
