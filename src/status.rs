//! Live `SyncSummary` for banners and status bars.
//!
//! The summary is derived, never stored: it is recomputed from the queue
//! whenever the queue revision, the network state or the orchestrator phase
//! changes, and published on a watch channel.

use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::models::{NetworkState, OfflineTransaction, SyncSummary, TransactionStatus};
use crate::queue::TransactionQueue;
use crate::sync::SyncOrchestrator;

/// Summary of the queued (not yet synced) rows plus the engine flags.
pub fn derive_summary(
    pending: &[OfflineTransaction],
    is_syncing: bool,
    is_online: bool,
    last_sync_time: Option<DateTime<Utc>>,
) -> SyncSummary {
    let last_error = pending
        .iter()
        .filter(|tx| tx.status == TransactionStatus::Failed && tx.last_error.is_some())
        .max_by_key(|tx| tx.last_attempt_at)
        .and_then(|tx| tx.last_error.clone());

    SyncSummary {
        pending_count: pending.len(),
        pending_amount: pending.iter().map(|tx| tx.amount).sum(),
        is_syncing,
        is_online,
        attention_count: pending.iter().filter(|tx| tx.needs_attention).count(),
        last_sync_time,
        last_error,
    }
}

pub struct SyncStatusAggregator {
    queue: Arc<TransactionQueue>,
    orchestrator: Arc<SyncOrchestrator>,
    network: watch::Receiver<NetworkState>,
    summary: watch::Sender<SyncSummary>,
    cancel: Mutex<Option<CancellationToken>>,
}

impl SyncStatusAggregator {
    pub fn new(
        queue: Arc<TransactionQueue>,
        orchestrator: Arc<SyncOrchestrator>,
        network: watch::Receiver<NetworkState>,
    ) -> Self {
        let (summary, _) = watch::channel(SyncSummary::default());
        Self {
            queue,
            orchestrator,
            network,
            summary,
            cancel: Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncSummary> {
        self.summary.subscribe()
    }

    /// Compute the summary now. Also republishes it if it changed.
    pub fn summary(&self) -> Result<SyncSummary> {
        let pending = self.queue.list_pending()?;
        let is_online = self.network.borrow().is_online;
        let summary = derive_summary(
            &pending,
            self.orchestrator.is_syncing(),
            is_online,
            self.orchestrator.last_sync_time(),
        );
        self.summary.send_if_modified(|current| {
            if *current == summary {
                return false;
            }
            *current = summary.clone();
            true
        });
        Ok(summary)
    }

    fn refresh(&self) {
        if let Err(e) = self.summary() {
            warn!(error = %e, "Failed to recompute sync summary; keeping previous");
        }
    }

    pub fn start(self: &Arc<Self>) {
        let mut slot = self.cancel.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return;
        }
        let token = CancellationToken::new();
        *slot = Some(token.clone());
        drop(slot);

        let aggregator = Arc::clone(self);
        tokio::spawn(async move {
            let mut revision = aggregator.queue.subscribe();
            let mut network = aggregator.network.clone();
            let mut phase = aggregator.orchestrator.subscribe_phase();
            aggregator.refresh();
            debug!("Sync status aggregator started");

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    changed = revision.changed() => {
                        if changed.is_err() { break; }
                        revision.borrow_and_update();
                    }
                    changed = network.changed() => {
                        if changed.is_err() { break; }
                        network.borrow_and_update();
                    }
                    changed = phase.changed() => {
                        if changed.is_err() { break; }
                        phase.borrow_and_update();
                    }
                }
                aggregator.refresh();
            }
            info!("Sync status aggregator stopped");
        });
    }

    pub fn stop(&self) {
        let token = self
            .cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(token) = token {
            token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::models::{NetworkQuality, NewTransaction, PaymentMethod};
    use crate::queue::FailureUpdate;
    use crate::retry::RetryPolicy;
    use crate::testing::FakeApi;
    use crate::wallet::WalletReconciler;
    use std::time::Duration;

    fn sale(wallet: &str, amount: i64) -> NewTransaction {
        NewTransaction {
            receipt_id: None,
            wallet_id: wallet.into(),
            amount,
            items: vec![],
            payment_method: PaymentMethod::Cash,
            created_at: None,
        }
    }

    fn setup() -> (
        Arc<TransactionQueue>,
        Arc<watch::Sender<NetworkState>>,
        Arc<SyncStatusAggregator>,
        Arc<SyncOrchestrator>,
    ) {
        let queue = Arc::new(TransactionQueue::new(Arc::new(
            db::open_in_memory().unwrap(),
        )));
        let api = Arc::new(FakeApi::default());
        let wallet = Arc::new(WalletReconciler::new(queue.clone(), api.clone()));
        let (net, rx) = watch::channel(NetworkState::default());
        let orchestrator = Arc::new(
            SyncOrchestrator::new(queue.clone(), api, wallet, rx.clone(), RetryPolicy::default())
                .unwrap(),
        );
        let aggregator = Arc::new(SyncStatusAggregator::new(
            queue.clone(),
            orchestrator.clone(),
            rx,
        ));
        (queue, Arc::new(net), aggregator, orchestrator)
    }

    #[test]
    fn test_summary_counts_and_latest_error() {
        let (queue, _, aggregator, _) = setup();
        let a = queue.enqueue(sale("W1", -500)).unwrap();
        let b = queue.enqueue(sale("W2", -250)).unwrap();
        queue.enqueue(sale("W3", 1_000)).unwrap();

        for (id, error, attention) in [(&a, "HTTP 503", false), (&b, "Insufficient funds", true)] {
            queue.mark_syncing(id).unwrap();
            queue
                .mark_failed(
                    id,
                    &FailureUpdate {
                        error: error.into(),
                        next_retry_at: None,
                        needs_attention: attention,
                    },
                )
                .unwrap();
            std::thread::sleep(Duration::from_millis(5));
        }

        let summary = aggregator.summary().unwrap();
        assert_eq!(summary.pending_count, 3);
        assert_eq!(summary.pending_amount, 250);
        assert_eq!(summary.attention_count, 1);
        assert_eq!(summary.last_error.as_deref(), Some("Insufficient funds"));
        assert!(!summary.is_syncing);
        assert!(!summary.is_online);
        assert_eq!(summary.last_sync_time, None);
    }

    #[test]
    fn test_empty_queue_summary() {
        let summary = derive_summary(&[], false, true, None);
        assert_eq!(summary.pending_count, 0);
        assert_eq!(summary.pending_amount, 0);
        assert_eq!(summary.last_error, None);
        assert!(summary.is_online);
    }

    #[tokio::test]
    async fn test_background_task_republishes_on_changes() {
        let (queue, net, aggregator, orchestrator) = setup();
        let mut rx = aggregator.subscribe();
        aggregator.start();

        queue.enqueue(sale("W1", -500)).unwrap();
        tokio::time::timeout(
            Duration::from_secs(2),
            rx.wait_for(|s| s.pending_count == 1),
        )
        .await
        .expect("summary after enqueue")
        .unwrap();

        net.send_replace(NetworkState {
            is_online: true,
            quality: NetworkQuality::Good,
            last_checked_at: None,
        });
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| s.is_online))
            .await
            .expect("summary after reconnect")
            .unwrap();

        orchestrator.sync_now().await.unwrap();
        let summary = tokio::time::timeout(
            Duration::from_secs(2),
            rx.wait_for(|s| s.pending_count == 0 && !s.is_syncing),
        )
        .await
        .expect("summary after pass")
        .unwrap()
        .clone();
        assert!(summary.last_sync_time.is_some());
        assert_eq!(summary.pending_amount, 0);
        aggregator.stop();
    }
}
