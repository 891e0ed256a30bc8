//! Headless sync agent.
//!
//! Runs the engine against the HTTP transactions API and logs status
//! changes until Ctrl-C. Usage: `pos-sync-agent [config.json]`.

use anyhow::Context;
use std::path::PathBuf;
use tracing::{info, warn};

use festival_pos_sync::{config::CONFIG_FILE_NAME, logging, EngineConfig, SyncEngine};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(CONFIG_FILE_NAME));

    let config = EngineConfig::load(Some(&config_path))
        .with_context(|| format!("loading configuration from {}", config_path.display()))?;

    let _log_guard = logging::init(
        &config.log_dir(),
        config.log_filter.as_deref(),
        config.log_json,
    )
    .context("initialising logging")?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        git_sha = env!("BUILD_GIT_SHA"),
        built = env!("BUILD_TIMESTAMP"),
        "Starting pos-sync-agent"
    );

    let engine = SyncEngine::open_http(config).context("opening sync engine")?;
    let attention = engine.queue().list_attention().context("reading queue")?;
    if !attention.is_empty() {
        warn!(count = attention.len(), "Transactions need operator attention");
    }

    let mut summary = engine.subscribe_summary();
    let mut wallet_events = engine.subscribe_wallet_events();
    engine.start();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl-C received, shutting down");
                break;
            }
            changed = summary.changed() => {
                if changed.is_err() {
                    break;
                }
                let s = summary.borrow_and_update().clone();
                info!(
                    pending = s.pending_count,
                    pending_amount = s.pending_amount,
                    syncing = s.is_syncing,
                    online = s.is_online,
                    attention = s.attention_count,
                    last_sync = ?s.last_sync_time,
                    last_error = s.last_error.as_deref().unwrap_or("-"),
                    "Sync status"
                );
            }
            event = wallet_events.recv() => {
                match event {
                    Ok(event) => info!(event = %serde_json::to_string(&event)?, "Wallet event"),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "Wallet event stream lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    engine.stop();
    Ok(())
}
