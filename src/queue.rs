//! Durable offline transaction queue.
//!
//! Every sale goes through `enqueue`, which commits the row to SQLite before
//! returning. Status changes only happen through the `mark_*` operations,
//! each a single guarded statement or SQLite transaction, so the sale flow
//! and a running sync pass can share the queue safely. Every mutation bumps
//! a revision counter that the status aggregator watches.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::db::DbState;
use crate::error::{Result, SyncError};
use crate::models::{
    format_ts, parse_ts, LineItem, NewTransaction, OfflineTransaction, ServerTransaction,
    TransactionStatus,
};
use crate::wallet;

const SELECT_COLUMNS: &str = "id, receipt_id, wallet_id, amount, items, payment_method, status,
     retry_count, last_attempt_at, last_error, next_retry_at, needs_attention,
     server_id, balance_after, created_at, updated_at";

const MAX_RECEIPT_ID_LEN: usize = 128;

/// Metadata recorded by `mark_failed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureUpdate {
    pub error: String,
    /// Earliest time of the next attempt; `None` means "next pass".
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Stop retrying until an operator requeues or discards the row.
    pub needs_attention: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub pending: i64,
    pub syncing: i64,
    pub failed: i64,
    pub needs_attention: i64,
    pub pending_amount: i64,
}

pub struct TransactionQueue {
    db: Arc<DbState>,
    revision: watch::Sender<u64>,
}

impl TransactionQueue {
    pub fn new(db: Arc<DbState>) -> Self {
        let (revision, _) = watch::channel(0);
        Self { db, revision }
    }

    pub fn db(&self) -> &Arc<DbState> {
        &self.db
    }

    /// Revision counter bumped after every committed mutation.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    fn bump(&self) {
        self.revision.send_modify(|rev| *rev = rev.wrapping_add(1));
    }

    // -----------------------------------------------------------------------
    // Enqueue
    // -----------------------------------------------------------------------

    /// Persist a new transaction and return its local id.
    ///
    /// The row is committed before this returns. A caller-supplied
    /// `receipt_id` that is already queued returns the existing id instead
    /// of inserting a second row.
    pub fn enqueue(&self, new_tx: NewTransaction) -> Result<String> {
        let wallet_id = new_tx.wallet_id.trim().to_string();
        if wallet_id.is_empty() {
            return Err(SyncError::Validation("walletId is required".into()));
        }
        if new_tx.amount == 0 {
            return Err(SyncError::Validation("amount must be non-zero".into()));
        }
        let receipt_id = match new_tx.receipt_id.as_deref().map(str::trim) {
            Some("") => return Err(SyncError::Validation("receiptId cannot be empty".into())),
            Some(r) if r.len() > MAX_RECEIPT_ID_LEN => {
                return Err(SyncError::Validation(format!(
                    "receiptId exceeds {MAX_RECEIPT_ID_LEN} characters"
                )))
            }
            Some(r) => r.to_string(),
            None => Uuid::new_v4().to_string(),
        };

        let conn = self.db.lock()?;

        let existing_id: Option<String> = conn
            .query_row(
                "SELECT id FROM offline_transactions WHERE receipt_id = ?1",
                params![receipt_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| SyncError::Persistence(format!("query idempotent receipt: {e}")))?;
        if let Some(id) = existing_id {
            info!(
                id = %id,
                receipt_id = %receipt_id,
                "Enqueue deduplicated via receipt_id"
            );
            return Ok(id);
        }

        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let created_at = format_ts(new_tx.created_at.unwrap_or(now));
        let items = serde_json::to_string(&new_tx.items)?;

        conn.execute(
            "INSERT INTO offline_transactions (
                id, receipt_id, wallet_id, amount, items, payment_method,
                status, retry_count, created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'PENDING', 0, ?7, ?8)",
            params![
                id,
                receipt_id,
                wallet_id,
                new_tx.amount,
                items,
                new_tx.payment_method.as_str(),
                created_at,
                format_ts(now),
            ],
        )
        .map_err(|e| SyncError::Persistence(format!("insert offline transaction: {e}")))?;
        drop(conn);

        info!(
            id = %id,
            receipt_id = %receipt_id,
            wallet_id = %wallet_id,
            amount = new_tx.amount,
            "Transaction enqueued"
        );
        self.bump();
        Ok(id)
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub fn get(&self, id: &str) -> Result<OfflineTransaction> {
        let conn = self.db.lock()?;
        query_one(&conn, "id = ?1", id)?.ok_or_else(|| SyncError::NotFound(id.to_string()))
    }

    pub fn get_by_receipt(&self, receipt_id: &str) -> Result<Option<OfflineTransaction>> {
        let conn = self.db.lock()?;
        query_one(&conn, "receipt_id = ?1", receipt_id)
    }

    /// Every queued, not yet synced transaction in FIFO order. Includes rows
    /// that need operator attention so they stay visible.
    pub fn list_pending(&self) -> Result<Vec<OfflineTransaction>> {
        let conn = self.db.lock()?;
        query_many(&conn, "status != 'SYNCED'", params![])
    }

    pub fn list_attention(&self) -> Result<Vec<OfflineTransaction>> {
        let conn = self.db.lock()?;
        query_many(
            &conn,
            "status != 'SYNCED' AND needs_attention = 1",
            params![],
        )
    }

    pub fn list_for_wallet(&self, wallet_id: &str) -> Result<Vec<OfflineTransaction>> {
        let conn = self.db.lock()?;
        query_many(
            &conn,
            "status != 'SYNCED' AND wallet_id = ?1",
            params![wallet_id],
        )
    }

    pub fn stats(&self) -> Result<QueueStats> {
        let conn = self.db.lock()?;
        let stats = conn.query_row(
            "SELECT
                COALESCE(SUM(status = 'PENDING'), 0),
                COALESCE(SUM(status = 'SYNCING'), 0),
                COALESCE(SUM(status = 'FAILED'), 0),
                COALESCE(SUM(needs_attention = 1 AND status != 'SYNCED'), 0),
                COALESCE(SUM(CASE WHEN status != 'SYNCED' THEN amount ELSE 0 END), 0)
             FROM offline_transactions",
            [],
            |row| {
                Ok(QueueStats {
                    pending: row.get(0)?,
                    syncing: row.get(1)?,
                    failed: row.get(2)?,
                    needs_attention: row.get(3)?,
                    pending_amount: row.get(4)?,
                })
            },
        )?;
        Ok(stats)
    }

    // -----------------------------------------------------------------------
    // Status transitions
    // -----------------------------------------------------------------------

    /// `PENDING | FAILED -> SYNCING`.
    pub fn mark_syncing(&self, id: &str) -> Result<()> {
        let conn = self.db.lock()?;
        let now = format_ts(Utc::now());
        let changed = conn.execute(
            "UPDATE offline_transactions
             SET status = 'SYNCING', last_attempt_at = ?1, updated_at = ?1
             WHERE id = ?2 AND status IN ('PENDING', 'FAILED')",
            params![now, id],
        )?;
        if changed == 0 {
            return Err(transition_error(&conn, id, "SYNCING"));
        }
        drop(conn);
        debug!(id = %id, "Transaction marked syncing");
        self.bump();
        Ok(())
    }

    /// `SYNCING -> SYNCED`. Records the server confirmation on the row and
    /// the wallet's confirmed balance in the same SQLite transaction, so the
    /// optimistic delta is replaced atomically.
    pub fn mark_synced(&self, id: &str, server_tx: &ServerTransaction) -> Result<i64> {
        let mut conn = self.db.lock()?;
        let tx = conn.transaction()?;

        let row: Option<(String, String, i64)> = tx
            .query_row(
                "SELECT wallet_id, receipt_id, amount FROM offline_transactions
                 WHERE id = ?1 AND status = 'SYNCING'",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        let Some((wallet_id, receipt_id, amount)) = row else {
            return Err(transition_error(&tx, id, "SYNCED"));
        };

        let now = Utc::now();
        tx.execute(
            "UPDATE offline_transactions
             SET status = 'SYNCED',
                 server_id = ?1,
                 balance_after = ?2,
                 next_retry_at = NULL,
                 updated_at = ?3
             WHERE id = ?4",
            params![server_tx.id, server_tx.balance_after, format_ts(now), id],
        )?;

        let confirmed = match server_tx.balance_after {
            Some(balance) => balance,
            None => wallet::confirmed_balance(&tx, &wallet_id)?.unwrap_or(0) + amount,
        };
        wallet::record_confirmed_balance(&tx, &wallet_id, confirmed, Some(&receipt_id), now)?;
        tx.commit()?;
        drop(conn);

        info!(
            id = %id,
            receipt_id = %receipt_id,
            server_id = %server_tx.id,
            balance_after = confirmed,
            "Transaction synced"
        );
        self.bump();
        Ok(confirmed)
    }

    /// `SYNCING | PENDING -> FAILED`. Increments `retry_count`.
    pub fn mark_failed(&self, id: &str, failure: &FailureUpdate) -> Result<OfflineTransaction> {
        let conn = self.db.lock()?;
        let now = format_ts(Utc::now());
        let changed = conn.execute(
            "UPDATE offline_transactions
             SET status = 'FAILED',
                 retry_count = retry_count + 1,
                 last_error = ?1,
                 last_attempt_at = ?2,
                 next_retry_at = ?3,
                 needs_attention = ?4,
                 updated_at = ?2
             WHERE id = ?5 AND status IN ('SYNCING', 'PENDING')",
            params![
                failure.error,
                now,
                failure.next_retry_at.map(format_ts),
                failure.needs_attention,
                id,
            ],
        )?;
        if changed == 0 {
            return Err(transition_error(&conn, id, "FAILED"));
        }
        let updated =
            query_one(&conn, "id = ?1", id)?.ok_or_else(|| SyncError::NotFound(id.to_string()))?;
        drop(conn);

        warn!(
            id = %id,
            receipt_id = %updated.receipt_id,
            retry_count = updated.retry_count,
            needs_attention = updated.needs_attention,
            error = %failure.error,
            "Transaction sync failed"
        );
        self.bump();
        Ok(updated)
    }

    /// Delete a confirmed row. Only `SYNCED` rows can be removed.
    pub fn remove(&self, id: &str) -> Result<()> {
        let conn = self.db.lock()?;
        let changed = conn.execute(
            "DELETE FROM offline_transactions WHERE id = ?1 AND status = 'SYNCED'",
            params![id],
        )?;
        if changed == 0 {
            return Err(transition_error(&conn, id, "REMOVED"));
        }
        drop(conn);
        debug!(id = %id, "Synced transaction removed from queue");
        self.bump();
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Operator actions and recovery
    // -----------------------------------------------------------------------

    /// Put a row that needs attention (or a failed row) back in line for the
    /// next pass. `retry_count` is kept.
    pub fn requeue(&self, id: &str) -> Result<()> {
        let conn = self.db.lock()?;
        let now = format_ts(Utc::now());
        let changed = conn.execute(
            "UPDATE offline_transactions
             SET status = 'PENDING', needs_attention = 0, next_retry_at = NULL, updated_at = ?1
             WHERE id = ?2 AND status = 'FAILED'",
            params![now, id],
        )?;
        if changed == 0 {
            return Err(transition_error(&conn, id, "PENDING"));
        }
        drop(conn);
        info!(id = %id, "Transaction requeued by operator");
        self.bump();
        Ok(())
    }

    /// Explicitly drop a row that needs attention. Returns the removed row.
    pub fn discard(&self, id: &str, reason: &str) -> Result<OfflineTransaction> {
        let mut conn = self.db.lock()?;
        let tx = conn.transaction()?;
        let Some(existing) = query_one(&tx, "id = ?1 AND needs_attention = 1", id)? else {
            return Err(transition_error(&tx, id, "DISCARDED"));
        };
        if existing.status == TransactionStatus::Syncing {
            return Err(transition_error(&tx, id, "DISCARDED"));
        }
        tx.execute(
            "DELETE FROM offline_transactions WHERE id = ?1",
            params![id],
        )?;
        tx.commit()?;
        drop(conn);

        warn!(
            id = %id,
            receipt_id = %existing.receipt_id,
            wallet_id = %existing.wallet_id,
            amount = existing.amount,
            reason = %reason,
            "Transaction discarded by operator"
        );
        self.bump();
        Ok(existing)
    }

    /// Repair rows left behind by a crash or kill: `SYNCING` rows revert to
    /// `PENDING`, and `SYNCED` rows whose removal never ran are deleted (their
    /// confirmed balance was committed with the status flip). Returns the
    /// number of reverted rows.
    pub fn recover_interrupted(&self) -> Result<usize> {
        let mut conn = self.db.lock()?;
        let now = format_ts(Utc::now());
        let tx = conn.transaction()?;
        let reverted = tx.execute(
            "UPDATE offline_transactions SET status = 'PENDING', updated_at = ?1
             WHERE status = 'SYNCING'",
            params![now],
        )?;
        let purged = tx.execute(
            "DELETE FROM offline_transactions WHERE status = 'SYNCED'",
            [],
        )?;
        tx.commit()?;
        drop(conn);
        if reverted > 0 {
            warn!(reverted, "Reverted interrupted in-flight transactions to PENDING");
        }
        if purged > 0 {
            warn!(purged, "Removed confirmed transactions left behind by an interrupted pass");
        }
        if reverted + purged > 0 {
            self.bump();
        }
        Ok(reverted)
    }
}

// ---------------------------------------------------------------------------
// Row helpers
// ---------------------------------------------------------------------------

fn transition_error(conn: &Connection, id: &str, to: &'static str) -> SyncError {
    let current: rusqlite::Result<Option<(String, bool)>> = conn
        .query_row(
            "SELECT status, needs_attention FROM offline_transactions WHERE id = ?1",
            params![id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional();
    match current {
        Ok(Some((status, attention))) => SyncError::InvalidTransition {
            id: id.to_string(),
            from: if attention {
                format!("{status} (needs attention)")
            } else {
                status
            },
            to,
        },
        Ok(None) => SyncError::NotFound(id.to_string()),
        Err(e) => e.into(),
    }
}

struct StoredRow {
    id: String,
    receipt_id: String,
    wallet_id: String,
    amount: i64,
    items: String,
    payment_method: String,
    status: String,
    retry_count: u32,
    last_attempt_at: Option<String>,
    last_error: Option<String>,
    next_retry_at: Option<String>,
    needs_attention: bool,
    server_id: Option<String>,
    balance_after: Option<i64>,
    created_at: String,
    updated_at: String,
}

impl StoredRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            receipt_id: row.get(1)?,
            wallet_id: row.get(2)?,
            amount: row.get(3)?,
            items: row.get(4)?,
            payment_method: row.get(5)?,
            status: row.get(6)?,
            retry_count: row.get(7)?,
            last_attempt_at: row.get(8)?,
            last_error: row.get(9)?,
            next_retry_at: row.get(10)?,
            needs_attention: row.get(11)?,
            server_id: row.get(12)?,
            balance_after: row.get(13)?,
            created_at: row.get(14)?,
            updated_at: row.get(15)?,
        })
    }

    fn into_transaction(self) -> Result<OfflineTransaction> {
        let items: Vec<LineItem> = serde_json::from_str(&self.items)?;
        Ok(OfflineTransaction {
            id: self.id,
            receipt_id: self.receipt_id,
            wallet_id: self.wallet_id,
            amount: self.amount,
            items,
            payment_method: self.payment_method.parse()?,
            status: self.status.parse()?,
            retry_count: self.retry_count,
            last_attempt_at: self.last_attempt_at.as_deref().map(parse_ts).transpose()?,
            last_error: self.last_error,
            next_retry_at: self.next_retry_at.as_deref().map(parse_ts).transpose()?,
            needs_attention: self.needs_attention,
            server_id: self.server_id,
            balance_after: self.balance_after,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

fn query_one(conn: &Connection, where_clause: &str, arg: &str) -> Result<Option<OfflineTransaction>> {
    let sql = format!("SELECT {SELECT_COLUMNS} FROM offline_transactions WHERE {where_clause}");
    let stored = conn
        .query_row(&sql, params![arg], StoredRow::from_row)
        .optional()?;
    stored.map(StoredRow::into_transaction).transpose()
}

fn query_many(
    conn: &Connection,
    where_clause: &str,
    args: &[&dyn rusqlite::ToSql],
) -> Result<Vec<OfflineTransaction>> {
    let sql = format!(
        "SELECT {SELECT_COLUMNS} FROM offline_transactions
         WHERE {where_clause}
         ORDER BY created_at ASC, seq ASC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(args, StoredRow::from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    rows.into_iter().map(StoredRow::into_transaction).collect()
}
