//! Remote transactions API.
//!
//! `TransactionApi` and `ReachabilityProbe` are the seams the orchestrator,
//! reconciler and network monitor depend on. `HttpTransactionApi` is the
//! reqwest implementation used in production; it classifies every response
//! into a `SubmitOutcome` or a `SubmitError` so the orchestrator never has to
//! look at HTTP details.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::config::ApiConfig;
use crate::error::{SubmitError, SyncError};
use crate::models::{ServerTransaction, SubmitOutcome, SubmitRequest};

const TRANSACTIONS_PATH: &str = "/api/transactions";
const WALLETS_PATH: &str = "/api/wallets";
const HEALTH_PATH: &str = "/api/health";

/// Error code the server uses on `409` when the receipt is already applied.
const DUPLICATE_RECEIPT_CODE: &str = "duplicate_receipt";

#[async_trait]
pub trait TransactionApi: Send + Sync {
    /// Submit one transaction. `request.receipt_id` is the idempotency key.
    async fn submit(&self, request: &SubmitRequest) -> Result<SubmitOutcome, SubmitError>;

    /// Authoritative balance of a wallet in minor units.
    async fn fetch_wallet_balance(&self, wallet_id: &str) -> Result<i64, SubmitError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeResult {
    pub reachable: bool,
    pub latency: Option<Duration>,
}

impl ProbeResult {
    pub fn unreachable() -> Self {
        Self {
            reachable: false,
            latency: None,
        }
    }
}

#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    async fn probe(&self) -> ProbeResult;
}

// ---------------------------------------------------------------------------
// URL normalisation
// ---------------------------------------------------------------------------

/// Normalise the API base URL:
/// - ensure a scheme is present (https, or http for localhost)
/// - strip trailing slashes and a trailing `/api` segment
pub fn normalize_base_url(url: &str) -> String {
    let mut url = url.trim().to_string();

    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    while url.ends_with('/') {
        url.pop();
    }
    if url.ends_with("/api") {
        url.truncate(url.len() - 4);
    }
    while url.ends_with('/') {
        url.pop();
    }

    url
}

fn percent_encode(input: &str) -> String {
    let mut encoded = String::with_capacity(input.len());
    for b in input.bytes() {
        let is_unreserved =
            b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b'.' || b == b'~';
        if is_unreserved {
            encoded.push(b as char);
        } else {
            encoded.push_str(&format!("%{b:02X}"));
        }
    }
    encoded
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Convert a `reqwest::Error` into a classified submit error.
fn transport_error(url: &str, err: &reqwest::Error) -> SubmitError {
    if err.is_timeout() {
        return SubmitError::Timeout(format!("Connection to {url} timed out"));
    }
    if err.is_connect() {
        return SubmitError::Network(format!("Cannot reach transactions API at {url}"));
    }
    if err.is_request() || err.is_body() {
        return SubmitError::Network(format!("Network error communicating with {url}: {err}"));
    }
    SubmitError::Unknown(format!("Unexpected error communicating with {url}: {err}"))
}

/// Fallback message for an HTTP status with no usable body.
fn status_message(status: StatusCode) -> String {
    match status.as_u16() {
        401 => "API key is invalid or expired".to_string(),
        403 => "Terminal not authorized".to_string(),
        404 => "Transactions API endpoint not found".to_string(),
        408 => "Request timed out at server".to_string(),
        429 => "Too many requests, retry later".to_string(),
        s if s >= 500 => format!("Transactions API server error (HTTP {s})"),
        s => format!("Unexpected response from transactions API (HTTP {s})"),
    }
}

fn str_any(v: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| v.get(*k).and_then(Value::as_str))
        .map(str::trim)
        .find(|s| !s.is_empty())
        .map(str::to_string)
}

fn i64_any(v: &Value, keys: &[&str]) -> Option<i64> {
    keys.iter().find_map(|k| v.get(*k).and_then(Value::as_i64))
}

fn bool_any(v: &Value, keys: &[&str]) -> bool {
    keys.iter()
        .any(|k| v.get(*k).and_then(Value::as_bool).unwrap_or(false))
}

fn error_detail(status: StatusCode, body: &Value, body_text: &str) -> (Option<String>, String) {
    let code = str_any(body, &["code", "errorCode", "error_code"]);
    let message = str_any(body, &["error", "message"])
        .or_else(|| {
            let trimmed = body_text.trim();
            (!trimmed.is_empty() && !trimmed.starts_with('{')).then(|| trimmed.to_string())
        })
        .unwrap_or_else(|| status_message(status));
    let message = match body.get("details").or_else(|| body.get("errors")) {
        Some(details) if !details.is_null() => format!("{message}: {details}"),
        _ => message,
    };
    (code, message)
}

/// Canonical server transaction from a response body. Accepts the record at
/// the top level or nested under `transaction`.
fn server_transaction(body: &Value) -> Option<ServerTransaction> {
    let record = body
        .get("transaction")
        .filter(|v| v.is_object())
        .unwrap_or(body);
    let id = str_any(record, &["id", "transactionId", "existingTransactionId"])
        .or_else(|| str_any(body, &["existingTransactionId"]))?;
    Some(ServerTransaction {
        id,
        receipt_id: str_any(record, &["receiptId", "receipt_id"]),
        balance_after: i64_any(record, &["balanceAfter", "balance_after"])
            .or_else(|| i64_any(body, &["balanceAfter", "balance_after"])),
    })
}

/// Map an HTTP response onto the submission contract.
pub fn classify_response(
    status: StatusCode,
    body_text: &str,
    receipt_id: &str,
) -> Result<SubmitOutcome, SubmitError> {
    let body: Value = serde_json::from_str(body_text).unwrap_or(Value::Null);
    let duplicate_flag = bool_any(&body, &["duplicate", "alreadyApplied", "already_applied"])
        || str_any(&body, &["status"]).as_deref() == Some("duplicate");

    if status.is_success() {
        let tx = server_transaction(&body).ok_or_else(|| {
            SubmitError::Unknown(format!(
                "Response for receipt {receipt_id} carried no transaction id (HTTP {})",
                status.as_u16()
            ))
        })?;
        return Ok(if duplicate_flag {
            SubmitOutcome::Duplicate(tx)
        } else {
            SubmitOutcome::Applied(tx)
        });
    }

    let (code, message) = error_detail(status, &body, body_text);
    let code_is_duplicate = code.as_deref() == Some(DUPLICATE_RECEIPT_CODE);

    match status.as_u16() {
        409 if duplicate_flag || code_is_duplicate => {
            let tx = server_transaction(&body).unwrap_or_else(|| ServerTransaction {
                id: receipt_id.to_string(),
                receipt_id: Some(receipt_id.to_string()),
                balance_after: None,
            });
            Ok(SubmitOutcome::Duplicate(tx))
        }
        401 | 403 => Err(SubmitError::Unauthorized(message)),
        408 | 429 => Err(SubmitError::Server {
            status: status.as_u16(),
            message,
        }),
        s if s >= 500 => Err(SubmitError::Server { status: s, message }),
        s if (400..500).contains(&s) => Err(SubmitError::Rejected {
            status: s,
            code,
            message,
        }),
        s => Err(SubmitError::Unknown(format!("{message} (HTTP {s})"))),
    }
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

pub struct HttpTransactionApi {
    client: Client,
    base_url: String,
    api_key: String,
    terminal_id: String,
    probe_timeout: Duration,
}

impl HttpTransactionApi {
    pub fn new(config: &ApiConfig) -> Result<Self, SyncError> {
        let base_url = normalize_base_url(&config.base_url);
        if base_url.len() <= "https://".len() {
            return Err(SyncError::Config("API base URL is empty".into()));
        }
        let client = Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| SyncError::Config(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url,
            api_key: config.api_key.clone().unwrap_or_default(),
            terminal_id: config.terminal_id.clone().unwrap_or_default(),
            probe_timeout: Duration::from_millis(config.probe_timeout_ms),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, format!("{}{path}", self.base_url))
            .header("X-POS-API-Key", &self.api_key)
            .header("x-terminal-id", &self.terminal_id)
    }
}

#[async_trait]
impl TransactionApi for HttpTransactionApi {
    async fn submit(&self, request: &SubmitRequest) -> Result<SubmitOutcome, SubmitError> {
        let resp = self
            .request(reqwest::Method::POST, TRANSACTIONS_PATH)
            .header("Idempotency-Key", &request.receipt_id)
            .json(request)
            .send()
            .await
            .map_err(|e| transport_error(&self.base_url, &e))?;

        let status = resp.status();
        let body_text = resp
            .text()
            .await
            .map_err(|e| transport_error(&self.base_url, &e))?;
        debug!(
            receipt_id = %request.receipt_id,
            status = status.as_u16(),
            "Transaction submit response"
        );
        classify_response(status, &body_text, &request.receipt_id)
    }

    async fn fetch_wallet_balance(&self, wallet_id: &str) -> Result<i64, SubmitError> {
        let path = format!("{WALLETS_PATH}/{}", percent_encode(wallet_id));
        let resp = self
            .request(reqwest::Method::GET, &path)
            .send()
            .await
            .map_err(|e| transport_error(&self.base_url, &e))?;
        let status = resp.status();
        let body_text = resp
            .text()
            .await
            .map_err(|e| transport_error(&self.base_url, &e))?;
        let body: Value = serde_json::from_str(&body_text).unwrap_or(Value::Null);

        if !status.is_success() {
            let (code, message) = error_detail(status, &body, &body_text);
            return Err(match status.as_u16() {
                401 | 403 => SubmitError::Unauthorized(message),
                s @ (408 | 429) => SubmitError::Server { status: s, message },
                s if s >= 500 => SubmitError::Server { status: s, message },
                s => SubmitError::Rejected {
                    status: s,
                    code,
                    message,
                },
            });
        }

        let record = body.get("wallet").filter(|v| v.is_object()).unwrap_or(&body);
        i64_any(record, &["balance", "balanceAfter"]).ok_or_else(|| {
            SubmitError::Unknown(format!("Wallet response for {wallet_id} has no balance"))
        })
    }
}

#[async_trait]
impl ReachabilityProbe for HttpTransactionApi {
    /// Lightweight `HEAD /api/health` with the terminal headers.
    async fn probe(&self) -> ProbeResult {
        let start = Instant::now();
        let result = self
            .request(reqwest::Method::HEAD, HEALTH_PATH)
            .timeout(self.probe_timeout)
            .send()
            .await;
        match result {
            Ok(resp) if resp.status().is_success() => ProbeResult {
                reachable: true,
                latency: Some(start.elapsed()),
            },
            Ok(resp) => {
                warn!(status = resp.status().as_u16(), "Health check returned non-success");
                ProbeResult::unreachable()
            }
            Err(e) => {
                debug!(error = %transport_error(&self.base_url, &e), "Health check failed");
                ProbeResult::unreachable()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{LineItem, PaymentMethod};
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn api_for(server: &MockServer) -> HttpTransactionApi {
        HttpTransactionApi::new(&ApiConfig {
            base_url: server.uri(),
            api_key: Some("key-123".into()),
            terminal_id: Some("term-7".into()),
            ..ApiConfig::default()
        })
        .expect("api client")
    }

    fn request() -> SubmitRequest {
        SubmitRequest {
            receipt_id: "R1".into(),
            wallet_id: "W1".into(),
            amount: -500,
            items: vec![LineItem {
                product_id: "p1".into(),
                name: "Lemonade".into(),
                quantity: 1,
                unit_price: 500,
            }],
            payment_method: PaymentMethod::Cashless,
        }
    }

    #[test]
    fn test_normalize_base_url() {
        assert_eq!(
            normalize_base_url("pay.festival.example/api/"),
            "https://pay.festival.example"
        );
        assert_eq!(normalize_base_url("localhost:8080/"), "http://localhost:8080");
        assert_eq!(
            normalize_base_url(" https://x.example//"),
            "https://x.example"
        );
    }

    #[test]
    fn test_classify_success_and_duplicates() {
        let ok = classify_response(
            StatusCode::CREATED,
            r#"{"id":"srv-1","balanceAfter":4500}"#,
            "R1",
        )
        .unwrap();
        assert_eq!(
            ok,
            SubmitOutcome::Applied(ServerTransaction {
                id: "srv-1".into(),
                receipt_id: None,
                balance_after: Some(4_500),
            })
        );

        let dup = classify_response(
            StatusCode::OK,
            r#"{"duplicate":true,"transaction":{"id":"srv-1","balanceAfter":4500}}"#,
            "R1",
        )
        .unwrap();
        assert!(matches!(dup, SubmitOutcome::Duplicate(ref tx) if tx.id == "srv-1"));

        let conflict = classify_response(
            StatusCode::CONFLICT,
            r#"{"code":"duplicate_receipt","error":"Receipt already applied"}"#,
            "R1",
        )
        .unwrap();
        assert_eq!(conflict.server_transaction().id, "R1");
        assert_eq!(conflict.server_transaction().balance_after, None);
    }

    #[test]
    fn test_classify_failures() {
        let rejected = classify_response(
            StatusCode::UNPROCESSABLE_ENTITY,
            r#"{"code":"insufficient_funds","error":"Insufficient funds"}"#,
            "R1",
        )
        .unwrap_err();
        assert_eq!(
            rejected,
            SubmitError::Rejected {
                status: 422,
                code: Some("insufficient_funds".into()),
                message: "Insufficient funds".into(),
            }
        );

        // A 409 that is not a duplicate is a real conflict: not retryable.
        let conflict = classify_response(StatusCode::CONFLICT, "{}", "R1").unwrap_err();
        assert!(!conflict.is_retryable());

        for status in [408u16, 429, 500, 502, 503] {
            let err = classify_response(StatusCode::from_u16(status).unwrap(), "", "R1")
                .unwrap_err();
            assert!(err.is_retryable(), "HTTP {status} should be retryable");
        }

        let auth = classify_response(StatusCode::UNAUTHORIZED, "", "R1").unwrap_err();
        assert!(auth.halts_pass());

        let missing_id = classify_response(StatusCode::OK, r#"{"ok":true}"#, "R1").unwrap_err();
        assert!(matches!(missing_id, SubmitError::Unknown(_)));
    }

    #[tokio::test]
    async fn test_submit_sends_idempotency_headers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/transactions"))
            .and(header("Idempotency-Key", "R1"))
            .and(header("X-POS-API-Key", "key-123"))
            .and(header("x-terminal-id", "term-7"))
            .respond_with(
                ResponseTemplate::new(201).set_body_json(json!({"id": "srv-1", "balanceAfter": 4500})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let outcome = api_for(&server).submit(&request()).await.unwrap();
        assert_eq!(outcome.server_transaction().balance_after, Some(4_500));
    }

    #[tokio::test]
    async fn test_submit_maps_server_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/transactions"))
            .respond_with(
                ResponseTemplate::new(503).set_body_json(json!({"error": "maintenance"})),
            )
            .mount(&server)
            .await;

        let err = api_for(&server).submit(&request()).await.unwrap_err();
        assert_eq!(
            err,
            SubmitError::Server {
                status: 503,
                message: "maintenance".into()
            }
        );
    }

    #[tokio::test]
    async fn test_unreachable_host_is_network_error() {
        let api = HttpTransactionApi::new(&ApiConfig {
            base_url: "http://127.0.0.1:9".into(),
            request_timeout_ms: 2_000,
            ..ApiConfig::default()
        })
        .unwrap();
        let err = api.submit(&request()).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(!api.probe().await.reachable);
    }

    #[tokio::test]
    async fn test_fetch_wallet_balance_and_probe() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/wallets/W%201"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"walletId": "W 1", "balance": 1200})),
            )
            .mount(&server)
            .await;
        Mock::given(method("HEAD"))
            .and(path("/api/health"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let api = api_for(&server);
        assert_eq!(api.fetch_wallet_balance("W 1").await.unwrap(), 1_200);
        let probe = api.probe().await;
        assert!(probe.reachable);
        assert!(probe.latency.is_some());
    }
}
