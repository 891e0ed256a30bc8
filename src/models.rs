//! Domain types shared by the queue, orchestrator, reconciler and status
//! aggregator.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::SyncError;

/// Status of a queued transaction. Only the queue's transition operations
/// move a row between these states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    Pending,
    Syncing,
    Synced,
    Failed,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "PENDING",
            TransactionStatus::Syncing => "SYNCING",
            TransactionStatus::Synced => "SYNCED",
            TransactionStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionStatus {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(TransactionStatus::Pending),
            "SYNCING" => Ok(TransactionStatus::Syncing),
            "SYNCED" => Ok(TransactionStatus::Synced),
            "FAILED" => Ok(TransactionStatus::Failed),
            other => Err(SyncError::Persistence(format!(
                "unknown transaction status in store: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentMethod {
    Cashless,
    Cash,
    Card,
    Voucher,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Cashless => "cashless",
            PaymentMethod::Cash => "cash",
            PaymentMethod::Card => "card",
            PaymentMethod::Voucher => "voucher",
        }
    }
}

impl FromStr for PaymentMethod {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cashless" | "wallet" => Ok(PaymentMethod::Cashless),
            "cash" => Ok(PaymentMethod::Cash),
            "card" => Ok(PaymentMethod::Card),
            "voucher" => Ok(PaymentMethod::Voucher),
            other => Err(SyncError::Validation(format!(
                "unsupported payment method: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineItem {
    pub product_id: String,
    pub name: String,
    pub quantity: u32,
    /// Minor currency units.
    pub unit_price: i64,
}

/// A sale or recharge as handed over by the sale-entry flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTransaction {
    #[serde(default)]
    pub receipt_id: Option<String>,
    pub wallet_id: String,
    /// Signed minor units: negative for sales, positive for recharges.
    pub amount: i64,
    #[serde(default)]
    pub items: Vec<LineItem>,
    pub payment_method: PaymentMethod,
    /// Time the sale happened; defaults to the enqueue time.
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineTransaction {
    pub id: String,
    pub receipt_id: String,
    pub wallet_id: String,
    pub amount: i64,
    pub items: Vec<LineItem>,
    pub payment_method: PaymentMethod,
    pub status: TransactionStatus,
    pub retry_count: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Set for rejections and exhausted retries; skipped by sync passes
    /// until an operator requeues or discards the row.
    pub needs_attention: bool,
    pub server_id: Option<String>,
    pub balance_after: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OfflineTransaction {
    /// Whether this row still contributes to the optimistic wallet balance.
    pub fn contributes_to_projection(&self) -> bool {
        !self.needs_attention
            && matches!(
                self.status,
                TransactionStatus::Pending | TransactionStatus::Syncing | TransactionStatus::Failed
            )
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_retry_at.map_or(true, |at| at <= now)
    }
}

/// Canonical transaction returned by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerTransaction {
    pub id: String,
    #[serde(default)]
    pub receipt_id: Option<String>,
    #[serde(default)]
    pub balance_after: Option<i64>,
}

/// What the remote API said about a submission that did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Applied(ServerTransaction),
    /// The server had already applied this receipt.
    Duplicate(ServerTransaction),
}

impl SubmitOutcome {
    pub fn server_transaction(&self) -> &ServerTransaction {
        match self {
            SubmitOutcome::Applied(tx) | SubmitOutcome::Duplicate(tx) => tx,
        }
    }
}

/// Body of `POST /api/transactions`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    pub receipt_id: String,
    pub wallet_id: String,
    pub amount: i64,
    pub items: Vec<LineItem>,
    pub payment_method: PaymentMethod,
}

impl From<&OfflineTransaction> for SubmitRequest {
    fn from(tx: &OfflineTransaction) -> Self {
        Self {
            receipt_id: tx.receipt_id.clone(),
            wallet_id: tx.wallet_id.clone(),
            amount: tx.amount,
            items: tx.items.clone(),
            payment_method: tx.payment_method,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkQuality {
    Good,
    Degraded,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkState {
    pub is_online: bool,
    pub quality: NetworkQuality,
    pub last_checked_at: Option<DateTime<Utc>>,
}

impl Default for NetworkState {
    fn default() -> Self {
        Self {
            is_online: false,
            quality: NetworkQuality::Unknown,
            last_checked_at: None,
        }
    }
}

/// Derived status shown by banners and status bars. Never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSummary {
    pub pending_count: usize,
    pub pending_amount: i64,
    pub is_syncing: bool,
    pub is_online: bool,
    pub attention_count: usize,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// RFC 3339 with millisecond precision so stored timestamps sort as text.
pub(crate) fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn parse_ts(raw: &str) -> Result<DateTime<Utc>, SyncError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| SyncError::Persistence(format!("bad timestamp {raw:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_status_round_trips_through_storage_text() {
        for status in [
            TransactionStatus::Pending,
            TransactionStatus::Syncing,
            TransactionStatus::Synced,
            TransactionStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<TransactionStatus>().unwrap(), status);
        }
        assert!("DONE".parse::<TransactionStatus>().is_err());
    }

    #[test]
    fn test_payment_method_accepts_wallet_alias() {
        assert_eq!(
            " Wallet ".parse::<PaymentMethod>().unwrap(),
            PaymentMethod::Cashless
        );
        assert!("bitcoin".parse::<PaymentMethod>().is_err());
    }

    #[test]
    fn test_stored_timestamps_sort_lexicographically() {
        let a = Utc.with_ymd_and_hms(2026, 7, 3, 9, 5, 0).unwrap();
        let b = a + chrono::Duration::milliseconds(7);
        assert!(format_ts(a) < format_ts(b));
        assert_eq!(parse_ts(&format_ts(b)).unwrap(), b);
    }

    #[test]
    fn test_submit_request_serializes_camel_case() {
        let req = SubmitRequest {
            receipt_id: "R1".into(),
            wallet_id: "W1".into(),
            amount: -500,
            items: vec![],
            payment_method: PaymentMethod::Cashless,
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["receiptId"], "R1");
        assert_eq!(json["walletId"], "W1");
        assert_eq!(json["paymentMethod"], "cashless");
    }
}
