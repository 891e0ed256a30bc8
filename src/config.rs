//! Engine configuration.
//!
//! Precedence, lowest first: built-in defaults, the JSON config file,
//! `FESTIVAL_POS_*` environment variables, then the OS keyring for the API
//! key and terminal id when neither of the others supplied them.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::credentials;
use crate::error::{Result, SyncError};
use crate::retry::RetryPolicy;

const ENV_PREFIX: &str = "FESTIVAL_POS_";
pub const CONFIG_FILE_NAME: &str = "pos-sync.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ApiConfig {
    pub base_url: String,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub terminal_id: Option<String>,
    pub request_timeout_ms: u64,
    pub probe_timeout_ms: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_key: None,
            terminal_id: None,
            request_timeout_ms: 15_000,
            probe_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NetworkConfig {
    pub poll_interval_ms: u64,
    /// Consecutive agreeing checks before a state flip is published.
    pub required_confirmations: u32,
    /// Probe latency above which a reachable link is `degraded`.
    pub degraded_latency_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 10_000,
            required_confirmations: 2,
            degraded_latency_ms: 1_500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncConfig {
    /// Periodic pass interval; `None` disables the timer.
    pub periodic_interval_ms: Option<u64>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            periodic_interval_ms: Some(60_000),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    pub data_dir: PathBuf,
    pub api: ApiConfig,
    pub network: NetworkConfig,
    pub sync: SyncConfig,
    pub retry: RetryPolicy,
    /// `EnvFilter` directive; `RUST_LOG` wins when set.
    pub log_filter: Option<String>,
    /// Write the log file as JSON lines.
    pub log_json: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./pos-data"),
            api: ApiConfig::default(),
            network: NetworkConfig::default(),
            sync: SyncConfig::default(),
            retry: RetryPolicy::default(),
            log_filter: None,
            log_json: false,
        }
    }
}

impl EngineConfig {
    /// Full load: file (if present), environment, keyring, validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) if p.exists() => Self::from_file(p)?,
            Some(p) => {
                debug!(path = %p.display(), "Config file not found, using defaults");
                Self::default()
            }
            None => Self::default(),
        };
        config.apply_env_from(|key| std::env::var(key).ok())?;
        config.fill_credentials_from(credentials::get_credential);
        config.validate()?;
        info!(
            data_dir = %config.data_dir.display(),
            base_url = %config.api.base_url,
            terminal_id = config.api.terminal_id.as_deref().unwrap_or("-"),
            api_key = %config.api.api_key.as_deref().map(credentials::redact).unwrap_or_default(),
            "Engine configuration loaded"
        );
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| SyncError::Config(format!("read {}: {e}", path.display())))?;
        serde_json::from_str(&raw)
            .map_err(|e| SyncError::Config(format!("parse {}: {e}", path.display())))
    }

    /// Apply `FESTIVAL_POS_*` overrides read through `lookup`.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| {
            lookup(&format!("{ENV_PREFIX}{name}"))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        if let Some(v) = var("DATA_DIR") {
            self.data_dir = PathBuf::from(v);
        }
        if let Some(v) = var("API_URL") {
            self.api.base_url = v;
        }
        if let Some(v) = var("API_KEY") {
            self.api.api_key = Some(v);
        }
        if let Some(v) = var("TERMINAL_ID") {
            self.api.terminal_id = Some(v);
        }
        if let Some(v) = var("REQUEST_TIMEOUT_MS") {
            self.api.request_timeout_ms = parse_num("REQUEST_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = var("POLL_INTERVAL_MS") {
            self.network.poll_interval_ms = parse_num("POLL_INTERVAL_MS", &v)?;
        }
        if let Some(v) = var("SYNC_INTERVAL_MS") {
            let ms: u64 = parse_num("SYNC_INTERVAL_MS", &v)?;
            self.sync.periodic_interval_ms = (ms > 0).then_some(ms);
        }
        if let Some(v) = var("MAX_RETRIES") {
            let max: u32 = parse_num("MAX_RETRIES", &v)?;
            self.retry.max_retries = (max > 0).then_some(max);
        }
        if let Some(v) = var("LOG") {
            self.log_filter = Some(v);
        }
        if let Some(v) = var("LOG_JSON") {
            self.log_json = matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes");
        }
        Ok(())
    }

    /// Fill the API key and terminal id from `lookup` when still unset.
    pub fn fill_credentials_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if self.api.api_key.is_none() {
            self.api.api_key = lookup(credentials::KEY_API_KEY);
        }
        if self.api.terminal_id.is_none() {
            self.api.terminal_id = lookup(credentials::KEY_TERMINAL_ID);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.api.base_url.trim().is_empty() {
            return Err(SyncError::Config(
                "API base URL is not set (api.baseUrl or FESTIVAL_POS_API_URL)".into(),
            ));
        }
        if self.network.required_confirmations == 0 {
            return Err(SyncError::Config(
                "network.requiredConfirmations must be at least 1".into(),
            ));
        }
        if self.network.poll_interval_ms == 0 {
            return Err(SyncError::Config("network.pollIntervalMs must be > 0".into()));
        }
        let retry = &self.retry;
        if retry.base_delay_ms == 0 || retry.max_delay_ms < retry.base_delay_ms {
            return Err(SyncError::Config(
                "retry delays must satisfy 0 < baseDelayMs <= maxDelayMs".into(),
            ));
        }
        if !(0.0..1.0).contains(&retry.jitter_ratio) {
            return Err(SyncError::Config(
                "retry.jitterRatio must be in [0, 1)".into(),
            ));
        }
        Ok(())
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }
}

fn parse_num<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T> {
    raw.parse()
        .map_err(|_| SyncError::Config(format!("{ENV_PREFIX}{name}: invalid number {raw:?}")))
}
