//! Configuration for the executor agent.
//!
//! A single TOML file (path given on the command line) with a small set of
//! environment overrides loaded through `dotenvy` in `main`. Invalid or
//! missing configuration is fatal at startup (exit code 1).

use crate::domain::errors::ExecutorError;
use crate::domain::safety::SafetyLimits;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct ExecutorSection {
    /// Human-readable name reported at registration
    pub name: String,
    /// Broker terminal flavor, e.g. "mt4" or "mt5"
    pub platform: String,
    pub broker_server: Option<String>,
    pub account_number: Option<String>,
    /// Directory for the embedded datastore
    pub data_dir: PathBuf,
}

impl Default for ExecutorSection {
    fn default() -> Self {
        Self {
            name: "fx-executor".to_string(),
            platform: "mt5".to_string(),
            broker_server: None,
            account_number: None,
            data_dir: PathBuf::from("./data"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct ControlSection {
    pub base_url: String,
    pub push_url: String,
    /// Pre-provisioned credential; when absent the agent registers itself
    pub executor_id: Option<String>,
    pub api_key: Option<String>,
    pub secret_key: Option<String>,
}

impl Default for ControlSection {
    fn default() -> Self {
        Self {
            base_url: "https://control.example.com".to_string(),
            push_url: "wss://control.example.com/ws".to_string(),
            executor_id: None,
            api_key: None,
            secret_key: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct BridgeSection {
    /// Request/reply socket of the in-terminal bridge
    pub rpc_addr: String,
    /// One-way stream socket of the in-terminal bridge
    pub stream_addr: String,
}

impl Default for BridgeSection {
    fn default() -> Self {
        Self {
            rpc_addr: "127.0.0.1:7601".to_string(),
            stream_addr: "127.0.0.1:7602".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct DispatcherSection {
    pub queue_capacity: usize,
    pub rate_limit: u32,
    pub rate_window_secs: u64,
}

impl Default for DispatcherSection {
    fn default() -> Self {
        Self {
            queue_capacity: 8_192,
            rate_limit: 100,
            rate_window_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct SafetySection {
    #[serde(flatten)]
    pub limits: SafetyLimits,
    /// Returns lookback for the correlation check, in bars
    pub correlation_lookback_bars: usize,
    pub limit_check_interval_secs: u64,
}

impl Default for SafetySection {
    fn default() -> Self {
        Self {
            limits: SafetyLimits::default(),
            correlation_lookback_bars: 100,
            limit_check_interval_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct MarketSection {
    pub ring_capacity: usize,
}

impl Default for MarketSection {
    fn default() -> Self {
        Self { ring_capacity: 500 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct MonitorSection {
    pub min_lot: Decimal,
    pub max_lot: Decimal,
    pub lot_step: Decimal,
    pub evaluation_timeout_ms: u64,
}

impl Default for MonitorSection {
    fn default() -> Self {
        Self {
            min_lot: Decimal::new(1, 2),
            max_lot: Decimal::from(100),
            lot_step: Decimal::new(1, 2),
            evaluation_timeout_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct SyncSection {
    pub position_sync_interval_secs: u64,
    pub snapshot_interval_secs: u64,
}

impl Default for SyncSection {
    fn default() -> Self {
        Self {
            position_sync_interval_secs: 30,
            snapshot_interval_secs: 60,
        }
    }
}

/// Aggregated agent configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct Config {
    pub executor: ExecutorSection,
    pub control: ControlSection,
    pub bridge: BridgeSection,
    pub dispatcher: DispatcherSection,
    pub safety: SafetySection,
    pub market: MarketSection,
    pub monitor: MonitorSection,
    pub sync: SyncSection,
}

impl Config {
    /// Load from a TOML file, apply environment overrides, validate.
    pub fn load(path: &Path) -> Result<Self, ExecutorError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            ExecutorError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        let mut config: Config = toml::from_str(&text)
            .map_err(|e| ExecutorError::Config(format!("invalid config: {e}")))?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("FX_CONTROL_URL") {
            self.control.base_url = url;
        }
        if let Ok(url) = std::env::var("FX_PUSH_URL") {
            self.control.push_url = url;
        }
        if let Ok(addr) = std::env::var("FX_BRIDGE_RPC_ADDR") {
            self.bridge.rpc_addr = addr;
        }
        if let Ok(addr) = std::env::var("FX_BRIDGE_STREAM_ADDR") {
            self.bridge.stream_addr = addr;
        }
        if let Ok(key) = std::env::var("FX_API_KEY") {
            self.control.api_key = Some(key);
        }
        if let Ok(key) = std::env::var("FX_SECRET_KEY") {
            self.control.secret_key = Some(key);
        }
    }

    fn validate(&self) -> Result<(), ExecutorError> {
        if self.executor.name.trim().is_empty() {
            return Err(ExecutorError::Config("executor.name is empty".to_string()));
        }
        let base = url::Url::parse(&self.control.base_url)
            .map_err(|e| ExecutorError::Config(format!("control.base_url: {e}")))?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(ExecutorError::Config(format!(
                "control.base_url is not an http(s) URL: {}",
                self.control.base_url
            )));
        }
        let push = url::Url::parse(&self.control.push_url)
            .map_err(|e| ExecutorError::Config(format!("control.push_url: {e}")))?;
        if !matches!(push.scheme(), "ws" | "wss") {
            return Err(ExecutorError::Config(format!(
                "control.push_url is not a ws(s) URL: {}",
                self.control.push_url
            )));
        }
        // A partial credential is a misconfiguration, not a registration
        // trigger.
        let provided = [
            self.control.executor_id.is_some(),
            self.control.api_key.is_some(),
            self.control.secret_key.is_some(),
        ];
        if provided.iter().any(|p| *p) && !provided.iter().all(|p| *p) {
            return Err(ExecutorError::Config(
                "control credential must set executor_id, api_key and secret_key together"
                    .to_string(),
            ));
        }
        if self.dispatcher.rate_limit == 0 || self.dispatcher.rate_window_secs == 0 {
            return Err(ExecutorError::Config(
                "dispatcher rate limit and window must be positive".to_string(),
            ));
        }
        if self.monitor.min_lot > self.monitor.max_lot {
            return Err(ExecutorError::Config(
                "monitor.min_lot exceeds monitor.max_lot".to_string(),
            ));
        }
        Ok(())
    }

    pub fn db_url(&self) -> String {
        format!(
            "sqlite://{}",
            self.executor.data_dir.join("executor.db").display()
        )
    }

    pub fn rate_window(&self) -> Duration {
        Duration::from_secs(self.dispatcher.rate_window_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_toml_gets_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.dispatcher.rate_limit, 100);
        assert_eq!(config.market.ring_capacity, 500);
        assert_eq!(config.safety.correlation_lookback_bars, 100);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_sections_parse() {
        let text = r#"
            [executor]
            name = "desk-7"
            platform = "mt4"
            data_dir = "/var/lib/fx"

            [control]
            base_url = "https://cloud.example.com"
            push_url = "wss://cloud.example.com/push"

            [bridge]
            rpc_addr = "127.0.0.1:9101"
            stream_addr = "127.0.0.1:9102"

            [safety]
            max_daily_loss = "500"
            max_open_positions = 4
            correlation_lookback_bars = 50

            [dispatcher]
            rate_limit = 20
            rate_window_secs = 30
        "#;
        let config: Config = toml::from_str(text).unwrap();
        assert_eq!(config.executor.name, "desk-7");
        assert_eq!(config.bridge.rpc_addr, "127.0.0.1:9101");
        assert_eq!(config.safety.limits.max_open_positions, 4);
        assert_eq!(config.safety.correlation_lookback_bars, 50);
        assert_eq!(config.dispatcher.rate_limit, 20);
        assert_eq!(config.db_url(), "sqlite:///var/lib/fx/executor.db");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_credential_is_invalid() {
        let text = r#"
            [control]
            api_key = "only-the-key"
        "#;
        let config: Config = toml::from_str(text).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_urls_rejected() {
        let text = r#"
            [control]
            base_url = "ftp://nope"
        "#;
        let config: Config = toml::from_str(text).unwrap();
        assert!(config.validate().is_err());
    }
}
