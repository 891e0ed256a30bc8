//! Festival POS offline transaction engine.
//!
//! Sales and wallet recharges are committed to a local SQLite queue the
//! moment they happen, replayed to the payments backend exactly once when
//! connectivity allows, and reconciled against the server's wallet balances.
//! `SyncEngine` wires the services together and owns their background tasks;
//! the individual services can also be used on their own.

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::info;

pub mod api;
pub mod config;
pub mod credentials;
pub mod db;
pub mod error;
pub mod logging;
pub mod models;
pub mod network;
pub mod queue;
pub mod retry;
pub mod status;
pub mod sync;
pub mod wallet;

#[cfg(test)]
mod testing;

pub use api::{HttpTransactionApi, ProbeResult, ReachabilityProbe, TransactionApi};
pub use config::EngineConfig;
pub use db::DbState;
pub use error::{Result, SubmitError, SyncError};
pub use models::{
    LineItem, NetworkQuality, NetworkState, NewTransaction, OfflineTransaction, PaymentMethod,
    ServerTransaction, SubmitOutcome, SyncSummary, TransactionStatus,
};
pub use network::NetworkMonitor;
pub use queue::{QueueStats, TransactionQueue};
pub use retry::RetryPolicy;
pub use status::SyncStatusAggregator;
pub use sync::{HaltReason, PassReport, SyncOrchestrator, SyncPhase, SyncTrigger};
pub use wallet::{project_balance, WalletBalance, WalletEvent, WalletReconciler};

/// Version, build timestamp and git SHA baked in by `build.rs`.
pub fn about() -> Value {
    json!({
        "version": env!("CARGO_PKG_VERSION"),
        "buildTimestamp": env!("BUILD_TIMESTAMP"),
        "gitSha": env!("BUILD_GIT_SHA"),
        "platform": std::env::consts::OS,
        "arch": std::env::consts::ARCH,
    })
}

pub struct SyncEngine {
    config: EngineConfig,
    queue: Arc<TransactionQueue>,
    wallet: Arc<WalletReconciler>,
    monitor: Arc<NetworkMonitor>,
    orchestrator: Arc<SyncOrchestrator>,
    status: Arc<SyncStatusAggregator>,
}

impl SyncEngine {
    /// Open the engine against the database in `config.data_dir`.
    pub fn open(
        config: EngineConfig,
        api: Arc<dyn TransactionApi>,
        probe: Arc<dyn ReachabilityProbe>,
    ) -> Result<Self> {
        let db = db::init(&config.data_dir)?;
        Self::with_db(db, config, api, probe)
    }

    /// Open against the HTTP API described by `config.api`.
    pub fn open_http(config: EngineConfig) -> Result<Self> {
        let http = Arc::new(HttpTransactionApi::new(&config.api)?);
        info!(base_url = %http.base_url(), "Using HTTP transactions API");
        Self::open(config, http.clone(), http)
    }

    pub fn with_db(
        db: DbState,
        config: EngineConfig,
        api: Arc<dyn TransactionApi>,
        probe: Arc<dyn ReachabilityProbe>,
    ) -> Result<Self> {
        let queue = Arc::new(TransactionQueue::new(Arc::new(db)));
        queue.recover_interrupted()?;

        let wallet = Arc::new(WalletReconciler::new(queue.clone(), api.clone()));
        let monitor = Arc::new(NetworkMonitor::new(probe, &config.network));
        let orchestrator = Arc::new(SyncOrchestrator::new(
            queue.clone(),
            api,
            wallet.clone(),
            monitor.subscribe(),
            config.retry.clone(),
        )?);
        let status = Arc::new(SyncStatusAggregator::new(
            queue.clone(),
            orchestrator.clone(),
            monitor.subscribe(),
        ));

        Ok(Self {
            config,
            queue,
            wallet,
            monitor,
            orchestrator,
            status,
        })
    }

    /// Spawn the monitor, sync loop and status tasks. Needs a tokio runtime.
    pub fn start(&self) {
        self.status.start();
        self.orchestrator.start(
            self.config
                .sync
                .periodic_interval_ms
                .map(Duration::from_millis),
        );
        self.monitor
            .start(Duration::from_millis(self.config.network.poll_interval_ms));
        info!(version = env!("CARGO_PKG_VERSION"), "Sync engine started");
    }

    pub fn stop(&self) {
        self.monitor.stop();
        self.orchestrator.stop();
        self.status.stop();
        info!("Sync engine stopped");
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn queue(&self) -> &Arc<TransactionQueue> {
        &self.queue
    }

    pub fn wallet(&self) -> &Arc<WalletReconciler> {
        &self.wallet
    }

    pub fn orchestrator(&self) -> &Arc<SyncOrchestrator> {
        &self.orchestrator
    }

    /// Record a sale or recharge. Returns once the row is committed.
    pub fn enqueue(&self, tx: NewTransaction) -> Result<String> {
        self.queue.enqueue(tx)
    }

    pub fn summary(&self) -> Result<SyncSummary> {
        self.status.summary()
    }

    pub fn subscribe_summary(&self) -> watch::Receiver<SyncSummary> {
        self.status.subscribe()
    }

    pub fn subscribe_network(&self) -> watch::Receiver<NetworkState> {
        self.monitor.subscribe()
    }

    pub fn subscribe_wallet_events(&self) -> broadcast::Receiver<WalletEvent> {
        self.wallet.subscribe()
    }

    pub async fn check_network(&self) -> NetworkState {
        self.monitor.check_now().await
    }

    pub async fn sync_now(&self) -> Result<Option<PassReport>> {
        self.orchestrator.sync_now().await
    }

    pub fn request_sync(&self) {
        self.orchestrator.request_sync();
    }

    pub fn set_foreground(&self, foreground: bool) {
        self.orchestrator.set_foreground(foreground);
    }

    pub fn balance(&self, wallet_id: &str) -> Result<WalletBalance> {
        self.wallet.balance(wallet_id)
    }

    pub fn requeue(&self, id: &str) -> Result<()> {
        self.queue.requeue(id)?;
        self.orchestrator.request_sync();
        Ok(())
    }

    pub fn discard(&self, id: &str, reason: &str) -> Result<OfflineTransaction> {
        self.queue.discard(id, reason)
    }
}
