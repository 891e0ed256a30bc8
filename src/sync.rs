//! Sync orchestrator.
//!
//! Drains the transaction queue against the remote API, one pass at a time.
//! Passes are started by triggers (network restored, app foreground, manual
//! request, periodic timer, retry timer); a trigger that arrives while a pass
//! is running is dropped. Within a pass items are submitted strictly in FIFO
//! order, and once a wallet has an item waiting for a retry the rest of that
//! wallet's items wait too.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::TransactionApi;
use crate::db;
use crate::error::{Result, SubmitError, SyncError};
use crate::models::{
    format_ts, parse_ts, NetworkState, OfflineTransaction, SubmitOutcome, SubmitRequest,
    TransactionStatus,
};
use crate::queue::{FailureUpdate, TransactionQueue};
use crate::retry::RetryPolicy;
use crate::wallet::WalletReconciler;

const SETTINGS_CATEGORY: &str = "sync";
const LAST_SYNC_KEY: &str = "last_sync_at";
/// Floor for the retry timer so a row whose deadline already passed cannot
/// spin the loop.
const MIN_RETRY_TIMER: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncPhase {
    Idle,
    Syncing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncTrigger {
    NetworkRestored,
    Foreground,
    Manual,
    Periodic,
    RetryTimer,
    /// Loop started while already online with rows queued.
    Startup,
}

impl fmt::Display for SyncTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncTrigger::NetworkRestored => "network_restored",
            SyncTrigger::Foreground => "foreground",
            SyncTrigger::Manual => "manual",
            SyncTrigger::Periodic => "periodic",
            SyncTrigger::RetryTimer => "retry_timer",
            SyncTrigger::Startup => "startup",
        };
        f.write_str(name)
    }
}

/// Why a pass stopped before reaching the end of the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum HaltReason {
    Offline,
    Backgrounded,
    Stopped,
    ConnectionLost(String),
    Unauthorized(String),
    /// Local storage failed mid-pass; the row in hand stays queued.
    Persistence(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PassReport {
    pub trigger: SyncTrigger,
    pub attempted: usize,
    /// Confirmed by the server, duplicates included.
    pub synced: usize,
    pub duplicates: usize,
    pub rejected: usize,
    pub retry_scheduled: usize,
    pub skipped: usize,
    pub halted: Option<HaltReason>,
}

impl PassReport {
    fn new(trigger: SyncTrigger) -> Self {
        Self {
            trigger,
            attempted: 0,
            synced: 0,
            duplicates: 0,
            rejected: 0,
            retry_scheduled: 0,
            skipped: 0,
            halted: None,
        }
    }
}

enum ItemOutcome {
    Synced { duplicate: bool },
    Rejected,
    RetryScheduled,
    Halt(HaltReason),
    /// The row changed under us (e.g. discarded by an operator).
    Vanished,
}

/// Resets the single-flight flag and the published phase, also when the
/// pass future is dropped mid-way.
struct PassGuard<'a> {
    orchestrator: &'a SyncOrchestrator,
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.orchestrator.is_running.store(false, Ordering::SeqCst);
        self.orchestrator.phase.send_replace(SyncPhase::Idle);
    }
}

pub struct SyncOrchestrator {
    queue: Arc<TransactionQueue>,
    api: Arc<dyn TransactionApi>,
    wallet: Arc<WalletReconciler>,
    network: watch::Receiver<NetworkState>,
    policy: RetryPolicy,
    is_running: AtomicBool,
    foreground: AtomicBool,
    phase: watch::Sender<SyncPhase>,
    last_sync: Mutex<Option<DateTime<Utc>>>,
    requested: Mutex<Option<SyncTrigger>>,
    wake: Notify,
    cancel: Mutex<Option<CancellationToken>>,
}

impl SyncOrchestrator {
    pub fn new(
        queue: Arc<TransactionQueue>,
        api: Arc<dyn TransactionApi>,
        wallet: Arc<WalletReconciler>,
        network: watch::Receiver<NetworkState>,
        policy: RetryPolicy,
    ) -> Result<Self> {
        let last_sync = {
            let conn = queue.db().lock()?;
            db::get_setting(&conn, SETTINGS_CATEGORY, LAST_SYNC_KEY)
        };
        let last_sync = match last_sync.as_deref().map(parse_ts) {
            Some(Ok(ts)) => Some(ts),
            Some(Err(e)) => {
                warn!(error = %e, "Ignoring unreadable last sync time");
                None
            }
            None => None,
        };
        let (phase, _) = watch::channel(SyncPhase::Idle);
        Ok(Self {
            queue,
            api,
            wallet,
            network,
            policy,
            is_running: AtomicBool::new(false),
            foreground: AtomicBool::new(true),
            phase,
            last_sync: Mutex::new(last_sync),
            requested: Mutex::new(None),
            wake: Notify::new(),
            cancel: Mutex::new(None),
        })
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<SyncPhase> {
        self.phase.subscribe()
    }

    pub fn is_syncing(&self) -> bool {
        *self.phase.borrow() == SyncPhase::Syncing
    }

    pub fn last_sync_time(&self) -> Option<DateTime<Utc>> {
        *self.last_sync.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// App lifecycle hook. Coming back to the foreground requests a pass;
    /// going to the background halts a running pass after its current item.
    pub fn set_foreground(&self, foreground: bool) {
        let was = self.foreground.swap(foreground, Ordering::SeqCst);
        if foreground && !was {
            debug!("App returned to foreground");
            self.request(SyncTrigger::Foreground);
        } else if !foreground && was {
            debug!("App moved to background");
        }
    }

    /// Ask the background loop for a pass without waiting for it.
    pub fn request_sync(&self) {
        self.request(SyncTrigger::Manual);
    }

    fn request(&self, trigger: SyncTrigger) {
        if self.is_running.load(Ordering::SeqCst) {
            debug!(trigger = %trigger, "Sync pass already running; trigger coalesced");
            return;
        }
        *self.requested.lock().unwrap_or_else(PoisonError::into_inner) = Some(trigger);
        self.wake.notify_one();
    }

    /// Run a pass now and wait for it. `None` if a pass was already running.
    pub async fn sync_now(&self) -> Result<Option<PassReport>> {
        self.trigger(SyncTrigger::Manual).await
    }

    /// Start a pass unless one is running. Returns `Ok(None)` for a
    /// coalesced trigger.
    pub async fn trigger(&self, trigger: SyncTrigger) -> Result<Option<PassReport>> {
        if self
            .is_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!(trigger = %trigger, "Sync pass already running; trigger coalesced");
            return Ok(None);
        }
        let _guard = PassGuard { orchestrator: self };
        self.phase.send_replace(SyncPhase::Syncing);
        // Requests made before this pass started are served by it.
        self.requested
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let report = self.run_pass(trigger).await?;

        if report.synced > 0 {
            if let Err(e) = self.record_last_sync(Utc::now()) {
                warn!(error = %e, "Failed to persist last sync time");
            }
        }
        info!(
            trigger = %report.trigger,
            attempted = report.attempted,
            synced = report.synced,
            duplicates = report.duplicates,
            rejected = report.rejected,
            retry_scheduled = report.retry_scheduled,
            skipped = report.skipped,
            halted = ?report.halted,
            "Sync pass finished"
        );
        Ok(Some(report))
    }

    /// Updates the in-memory time even when persisting it fails.
    fn record_last_sync(&self, at: DateTime<Utc>) -> Result<()> {
        *self.last_sync.lock().unwrap_or_else(PoisonError::into_inner) = Some(at);
        let conn = self.queue.db().lock()?;
        db::set_setting(&conn, SETTINGS_CATEGORY, LAST_SYNC_KEY, &format_ts(at))?;
        Ok(())
    }

    fn halt_reason(&self, stop: Option<&CancellationToken>) -> Option<HaltReason> {
        if stop.is_some_and(CancellationToken::is_cancelled) {
            return Some(HaltReason::Stopped);
        }
        if !self.network.borrow().is_online {
            return Some(HaltReason::Offline);
        }
        if !self.foreground.load(Ordering::SeqCst) {
            return Some(HaltReason::Backgrounded);
        }
        None
    }

    async fn run_pass(&self, trigger: SyncTrigger) -> Result<PassReport> {
        let mut report = PassReport::new(trigger);
        let stop = self
            .cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        // Only a pass marks rows SYNCING and passes never overlap, so any
        // SYNCING row seen here was left behind by an aborted pass.
        self.queue.recover_interrupted()?;
        let items = self.queue.list_pending()?;
        debug!(trigger = %trigger, queued = items.len(), "Sync pass started");

        let mut blocked_wallets: HashSet<String> = HashSet::new();
        for tx in &items {
            if tx.needs_attention || blocked_wallets.contains(&tx.wallet_id) {
                report.skipped += 1;
                continue;
            }
            if !tx.is_due(Utc::now()) {
                blocked_wallets.insert(tx.wallet_id.clone());
                report.skipped += 1;
                continue;
            }
            if let Some(reason) = self.halt_reason(stop.as_ref()) {
                info!(reason = ?reason, "Sync pass halted");
                report.halted = Some(reason);
                break;
            }

            report.attempted += 1;
            let outcome = match self.process(tx).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(id = %tx.id, error = %e, "Storage failure mid-pass; halting");
                    report.halted = Some(HaltReason::Persistence(e.to_string()));
                    break;
                }
            };
            match outcome {
                ItemOutcome::Synced { duplicate } => {
                    report.synced += 1;
                    if duplicate {
                        report.duplicates += 1;
                    }
                }
                ItemOutcome::Rejected => report.rejected += 1,
                ItemOutcome::RetryScheduled => {
                    report.retry_scheduled += 1;
                    blocked_wallets.insert(tx.wallet_id.clone());
                }
                ItemOutcome::Halt(reason) => {
                    report.retry_scheduled += 1;
                    warn!(reason = ?reason, "Sync pass halted");
                    report.halted = Some(reason);
                    break;
                }
                ItemOutcome::Vanished => {
                    report.attempted -= 1;
                    report.skipped += 1;
                }
            }
        }
        Ok(report)
    }

    async fn process(&self, tx: &OfflineTransaction) -> Result<ItemOutcome> {
        match self.queue.mark_syncing(&tx.id) {
            Ok(()) => {}
            Err(SyncError::NotFound(_) | SyncError::InvalidTransition { .. }) => {
                debug!(id = %tx.id, "Row changed before submission; skipping");
                return Ok(ItemOutcome::Vanished);
            }
            Err(e) => return Err(e),
        }

        let request = SubmitRequest::from(tx);
        match self.api.submit(&request).await {
            Ok(outcome) => {
                let duplicate = matches!(outcome, SubmitOutcome::Duplicate(_));
                if duplicate {
                    info!(
                        receipt_id = %tx.receipt_id,
                        "Receipt already applied by server; treating as synced"
                    );
                }
                let confirmed = self.queue.mark_synced(&tx.id, outcome.server_transaction())?;
                self.wallet.on_synced(tx, confirmed);
                self.queue.remove(&tx.id)?;
                Ok(ItemOutcome::Synced { duplicate })
            }
            Err(err) if !err.is_retryable() => {
                let reason = err.to_string();
                let failed = self.queue.mark_failed(
                    &tx.id,
                    &FailureUpdate {
                        error: reason.clone(),
                        next_retry_at: None,
                        needs_attention: true,
                    },
                )?;
                self.wallet.on_rejected(&failed, &reason);
                Ok(ItemOutcome::Rejected)
            }
            Err(err) => self.schedule_retry(tx, err),
        }
    }

    fn schedule_retry(&self, tx: &OfflineTransaction, err: SubmitError) -> Result<ItemOutcome> {
        // Credential failures say nothing about the sale itself.
        let counts_toward_cap = !matches!(err, SubmitError::Unauthorized(_));
        let exhausted = counts_toward_cap && self.policy.is_exhausted(tx.retry_count + 1);
        let next_retry_at =
            (!exhausted).then(|| self.policy.next_retry_at(Utc::now(), tx.retry_count));

        let failed = self.queue.mark_failed(
            &tx.id,
            &FailureUpdate {
                error: err.to_string(),
                next_retry_at,
                needs_attention: exhausted,
            },
        )?;

        if exhausted {
            let reason = if err.outcome_unknown() {
                format!("retries exhausted, server outcome unknown (check before refunding): {err}")
            } else {
                format!("retries exhausted: {err}")
            };
            self.wallet.on_rejected(&failed, &reason);
        } else if self.policy.should_warn(failed.retry_count) {
            warn!(
                receipt_id = %failed.receipt_id,
                retry_count = failed.retry_count,
                error = %err,
                "Transaction keeps failing to sync"
            );
        }

        if !err.halts_pass() {
            return Ok(ItemOutcome::RetryScheduled);
        }
        Ok(ItemOutcome::Halt(match err {
            SubmitError::Unauthorized(msg) => HaltReason::Unauthorized(msg),
            other => HaltReason::ConnectionLost(other.to_string()),
        }))
    }

    /// Earliest time a deferred wallet can make progress: the `next_retry_at`
    /// of the first eligible row of each wallet.
    fn next_retry_deadline(&self) -> Result<Option<DateTime<Utc>>> {
        let items = self.queue.list_pending()?;
        let mut seen: HashSet<&str> = HashSet::new();
        let mut earliest: Option<DateTime<Utc>> = None;
        for tx in &items {
            if tx.needs_attention || !seen.insert(tx.wallet_id.as_str()) {
                continue;
            }
            if tx.status == TransactionStatus::Failed {
                if let Some(at) = tx.next_retry_at {
                    earliest = Some(earliest.map_or(at, |e| e.min(at)));
                }
            }
        }
        Ok(earliest)
    }

    fn retry_timer_deadline(&self) -> Option<Instant> {
        if !self.network.borrow().is_online || !self.foreground.load(Ordering::SeqCst) {
            return None;
        }
        let at = match self.next_retry_deadline() {
            Ok(at) => at?,
            Err(e) => {
                warn!(error = %e, "Could not compute retry deadline");
                return None;
            }
        };
        let wait = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        Some(Instant::now() + wait.max(MIN_RETRY_TIMER))
    }

    fn has_work(&self) -> bool {
        match self.queue.list_pending() {
            Ok(items) => items.iter().any(|tx| !tx.needs_attention),
            Err(e) => {
                warn!(error = %e, "Could not read queue");
                false
            }
        }
    }

    /// Spawn the trigger loop. A second call while running is ignored.
    pub fn start(self: &Arc<Self>, periodic: Option<Duration>) {
        let mut slot = self.cancel.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            debug!("Sync loop already running");
            return;
        }
        let token = CancellationToken::new();
        *slot = Some(token.clone());
        drop(slot);

        // Read the starting state before spawning so a flip that lands before
        // the task first runs still shows up as a change.
        let mut network = self.network.clone();
        let mut was_online = network.borrow_and_update().is_online;

        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            info!(periodic = ?periodic, online = was_online, "Sync loop started");
            if was_online && orchestrator.has_work() {
                if let Err(e) = orchestrator.trigger(SyncTrigger::Startup).await {
                    warn!(error = %e, "Startup sync pass failed");
                }
            }
            let mut ticker = periodic.map(|period| {
                let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                ticker
            });

            loop {
                let retry_deadline = orchestrator.retry_timer_deadline();
                let trigger = tokio::select! {
                    _ = token.cancelled() => break,
                    changed = network.changed() => {
                        if changed.is_err() {
                            warn!("Network monitor gone; sync loop exiting");
                            break;
                        }
                        let online = network.borrow_and_update().is_online;
                        let restored = online && !was_online;
                        was_online = online;
                        if !restored {
                            if !online {
                                info!("Network offline; deferring sync and keeping queue pending");
                            }
                            continue;
                        }
                        info!("Network restored; resuming queued sync");
                        SyncTrigger::NetworkRestored
                    }
                    _ = orchestrator.wake.notified() => {
                        let requested = orchestrator
                            .requested
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .take();
                        // A stale permit whose request was served by a pass.
                        let Some(trigger) = requested else { continue };
                        trigger
                    }
                    _ = tick(&mut ticker) => SyncTrigger::Periodic,
                    _ = sleep_until(retry_deadline) => SyncTrigger::RetryTimer,
                };

                if let Err(e) = orchestrator.trigger(trigger).await {
                    warn!(trigger = %trigger, error = %e, "Sync pass failed");
                }
            }
            info!("Sync loop stopped");
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

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(t) => {
            t.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
