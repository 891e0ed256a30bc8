//! Wallet balance reconciliation.
//!
//! Two layers: the last server-confirmed balance (stored in
//! `wallet_balances`) and the optimistic delta of the wallet's queued
//! transactions. The displayed balance is always `project_balance` of the
//! two; nothing stores the projected figure.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::api::TransactionApi;
use crate::error::Result;
use crate::models::{format_ts, OfflineTransaction};
use crate::queue::TransactionQueue;

const EVENT_CAPACITY: usize = 64;

/// Confirmed balance plus the signed amounts of every queued transaction
/// that may still apply (not synced, not flagged for the operator).
pub fn project_balance<'a, I>(confirmed: i64, queued: I) -> i64
where
    I: IntoIterator<Item = &'a OfflineTransaction>,
{
    queued
        .into_iter()
        .filter(|tx| tx.contributes_to_projection())
        .fold(confirmed, |acc, tx| acc.saturating_add(tx.amount))
}

pub(crate) fn confirmed_balance(conn: &Connection, wallet_id: &str) -> Result<Option<i64>> {
    let balance = conn
        .query_row(
            "SELECT confirmed_balance FROM wallet_balances WHERE wallet_id = ?1",
            params![wallet_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(balance)
}

pub(crate) fn record_confirmed_balance(
    conn: &Connection,
    wallet_id: &str,
    balance: i64,
    source_receipt_id: Option<&str>,
    at: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO wallet_balances (wallet_id, confirmed_balance, source_receipt_id, confirmed_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(wallet_id) DO UPDATE SET
            confirmed_balance = excluded.confirmed_balance,
            source_receipt_id = excluded.source_receipt_id,
            confirmed_at = excluded.confirmed_at",
        params![wallet_id, balance, source_receipt_id, format_ts(at)],
    )?;
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletBalance {
    pub wallet_id: String,
    /// `None` until the server has confirmed anything for this wallet.
    pub confirmed: Option<i64>,
    pub pending_delta: i64,
    pub displayed: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WalletEvent {
    #[serde(rename_all = "camelCase")]
    BalanceConfirmed {
        wallet_id: String,
        receipt_id: String,
        balance: i64,
    },
    /// The sale did not apply; its amount left the projection.
    #[serde(rename_all = "camelCase")]
    SaleReversed {
        wallet_id: String,
        receipt_id: String,
        amount: i64,
        reason: String,
    },
}

pub struct WalletReconciler {
    queue: Arc<TransactionQueue>,
    api: Arc<dyn TransactionApi>,
    events: broadcast::Sender<WalletEvent>,
}

impl WalletReconciler {
    pub fn new(queue: Arc<TransactionQueue>, api: Arc<dyn TransactionApi>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self { queue, api, events }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WalletEvent> {
        self.events.subscribe()
    }

    pub fn balance(&self, wallet_id: &str) -> Result<WalletBalance> {
        let confirmed = {
            let conn = self.queue.db().lock()?;
            confirmed_balance(&conn, wallet_id)?
        };
        let queued = self.queue.list_for_wallet(wallet_id)?;
        let base = confirmed.unwrap_or(0);
        let displayed = project_balance(base, &queued);
        Ok(WalletBalance {
            wallet_id: wallet_id.to_string(),
            confirmed,
            pending_delta: displayed - base,
            displayed,
        })
    }

    pub fn displayed_balance(&self, wallet_id: &str) -> Result<i64> {
        Ok(self.balance(wallet_id)?.displayed)
    }

    /// Record a balance learned outside the sync path, e.g. from a wallet
    /// lookup at the point of sale.
    pub fn seed_confirmed_balance(&self, wallet_id: &str, balance: i64) -> Result<()> {
        let conn = self.queue.db().lock()?;
        record_confirmed_balance(&conn, wallet_id, balance, None, Utc::now())?;
        info!(wallet_id = %wallet_id, balance, "Confirmed wallet balance seeded");
        Ok(())
    }

    /// Fetch the authoritative balance from the server.
    ///
    /// Must not run while a pass is submitting this wallet's transactions:
    /// an applied-but-unconfirmed submission would be counted twice until
    /// the pass confirms it.
    pub async fn refresh(&self, wallet_id: &str) -> Result<WalletBalance> {
        let balance = self.api.fetch_wallet_balance(wallet_id).await?;
        self.seed_confirmed_balance(wallet_id, balance)?;
        self.balance(wallet_id)
    }

    /// Called after `mark_synced` replaced the delta with `confirmed`.
    pub fn on_synced(&self, tx: &OfflineTransaction, confirmed: i64) {
        let _ = self.events.send(WalletEvent::BalanceConfirmed {
            wallet_id: tx.wallet_id.clone(),
            receipt_id: tx.receipt_id.clone(),
            balance: confirmed,
        });
    }

    /// Called after a row was flagged for the operator. Its amount no longer
    /// counts toward the displayed balance.
    pub fn on_rejected(&self, tx: &OfflineTransaction, reason: &str) {
        warn!(
            wallet_id = %tx.wallet_id,
            receipt_id = %tx.receipt_id,
            amount = tx.amount,
            reason = %reason,
            "Sale did not apply; reversed from projected balance"
        );
        let _ = self.events.send(WalletEvent::SaleReversed {
            wallet_id: tx.wallet_id.clone(),
            receipt_id: tx.receipt_id.clone(),
            amount: tx.amount,
            reason: reason.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::models::{NewTransaction, PaymentMethod, ServerTransaction};
    use crate::queue::FailureUpdate;
    use crate::testing::FakeApi;

    fn setup() -> (Arc<TransactionQueue>, Arc<FakeApi>, WalletReconciler) {
        let queue = Arc::new(TransactionQueue::new(Arc::new(
            db::open_in_memory().expect("in-memory db"),
        )));
        let api = Arc::new(FakeApi::default());
        let reconciler = WalletReconciler::new(queue.clone(), api.clone());
        (queue, api, reconciler)
    }

    fn sale(wallet: &str, amount: i64) -> NewTransaction {
        NewTransaction {
            receipt_id: None,
            wallet_id: wallet.into(),
            amount,
            items: vec![],
            payment_method: PaymentMethod::Cashless,
            created_at: None,
        }
    }

    #[test]
    fn test_projection_adds_pending_deltas_to_confirmed() {
        let (queue, _, reconciler) = setup();
        reconciler.seed_confirmed_balance("W1", 5_000).unwrap();
        queue.enqueue(sale("W1", -500)).unwrap();
        queue.enqueue(sale("W1", 2_000)).unwrap();
        queue.enqueue(sale("W2", -999)).unwrap();

        let balance = reconciler.balance("W1").unwrap();
        assert_eq!(balance.confirmed, Some(5_000));
        assert_eq!(balance.pending_delta, 1_500);
        assert_eq!(balance.displayed, 6_500);
    }

    #[test]
    fn test_sync_replaces_delta_with_server_balance() {
        let (queue, _, reconciler) = setup();
        reconciler.seed_confirmed_balance("W1", 5_000).unwrap();
        let id = queue.enqueue(sale("W1", -500)).unwrap();
        assert_eq!(reconciler.displayed_balance("W1").unwrap(), 4_500);

        queue.mark_syncing(&id).unwrap();
        // Server disagrees with the local view (e.g. a top-up elsewhere).
        queue
            .mark_synced(
                &id,
                &ServerTransaction {
                    id: "srv".into(),
                    receipt_id: None,
                    balance_after: Some(9_500),
                },
            )
            .unwrap();
        assert_eq!(reconciler.displayed_balance("W1").unwrap(), 9_500);
        queue.remove(&id).unwrap();
        assert_eq!(reconciler.displayed_balance("W1").unwrap(), 9_500);
    }

    #[test]
    fn test_rejected_sale_is_reversed_and_announced() {
        let (queue, _, reconciler) = setup();
        let mut events = reconciler.subscribe();
        reconciler.seed_confirmed_balance("W1", 100).unwrap();
        let id = queue.enqueue(sale("W1", -500)).unwrap();
        assert_eq!(reconciler.displayed_balance("W1").unwrap(), -400);

        queue.mark_syncing(&id).unwrap();
        let failed = queue
            .mark_failed(
                &id,
                &FailureUpdate {
                    error: "Insufficient funds".into(),
                    next_retry_at: None,
                    needs_attention: true,
                },
            )
            .unwrap();
        reconciler.on_rejected(&failed, "Insufficient funds");

        assert_eq!(reconciler.displayed_balance("W1").unwrap(), 100);
        match events.try_recv().unwrap() {
            WalletEvent::SaleReversed { amount, reason, .. } => {
                assert_eq!(amount, -500);
                assert_eq!(reason, "Insufficient funds");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_retryable_failures_keep_contributing() {
        let (queue, _, reconciler) = setup();
        let id = queue.enqueue(sale("W1", -500)).unwrap();
        queue.mark_syncing(&id).unwrap();
        queue
            .mark_failed(
                &id,
                &FailureUpdate {
                    error: "HTTP 503".into(),
                    next_retry_at: None,
                    needs_attention: false,
                },
            )
            .unwrap();
        assert_eq!(reconciler.displayed_balance("W1").unwrap(), -500);
    }

    #[tokio::test]
    async fn test_refresh_uses_server_balance() {
        let (queue, api, reconciler) = setup();
        api.set_wallet_balance("W1", 7_000);
        queue.enqueue(sale("W1", -1_000)).unwrap();

        let balance = reconciler.refresh("W1").await.unwrap();
        assert_eq!(balance.confirmed, Some(7_000));
        assert_eq!(balance.displayed, 6_000);
    }
}
