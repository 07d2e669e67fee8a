//! Ledger node binary
//!
//! Hosts the ledger in a long-running process until interrupted.
//! Configuration comes from the TOML file named by `LEDGER_CONFIG` (if set)
//! with `LEDGER_*` environment overrides on top.

use anyhow::Context;
use player_ledger::{Config, Ledger};
use std::path::Path;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if std::env::var("LEDGER_LOG_JSON").map(|v| v == "1").unwrap_or(false) {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    tracing::info!("Starting player ledger node");

    // Load configuration
    let config = match std::env::var("LEDGER_CONFIG") {
        Ok(path) => {
            let mut config = Config::from_file(&path)
                .with_context(|| format!("reading configuration from {}", path))?;
            config.apply_env().context("applying environment overrides")?;
            config
        }
        Err(_) => Config::from_env().context("reading configuration from environment")?,
    };

    if let Some(dir) = sqlite_parent_dir(&config.storage.database_url) {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating data directory {}", dir.display()))?;
    }

    // Open ledger
    let ledger = Ledger::open(config).await.context("opening ledger")?;
    tracing::info!(
        currencies = ledger.config().currencies.len(),
        leaderboard = ledger.config().leaderboard.enabled,
        "Ledger opened successfully"
    );

    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down ledger node");
    ledger.shutdown().await.context("shutting down ledger")?;
    Ok(())
}

/// Directory holding a file-backed SQLite database, if the URL names one
fn sqlite_parent_dir(url: &str) -> Option<&Path> {
    let path = url.strip_prefix("sqlite://").or_else(|| url.strip_prefix("sqlite:"))?;
    if path.contains(":memory:") {
        return None;
    }
    Path::new(path)
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
}
