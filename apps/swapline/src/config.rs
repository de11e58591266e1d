use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

pub const DEFAULT_SIGNALING_URL: &str = "ws://127.0.0.1:8080/signal";
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";
pub const TRADE_CHANNEL_LABEL: &str = "trade";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl From<toml::de::Error> for ConfigError {
    fn from(value: toml::de::Error) -> Self {
        ConfigError::Parse(value.to_string())
    }
}

/// Bounded retry schedule: `max_retries` further attempts after the first,
/// each preceded by `delay_ms` plus up to `jitter_ms` of random spread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub delay_ms: u64,
    pub jitter_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            delay_ms: 1_000,
            jitter_ms: 0,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            delay_ms: delay.as_millis() as u64,
            jitter_ms: 0,
        }
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter_ms = jitter.as_millis() as u64;
        self
    }

    pub fn none() -> Self {
        Self {
            max_retries: 0,
            delay_ms: 0,
            jitter_ms: 0,
        }
    }

    pub fn total_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Whether a retry numbered `retry` (1-based) is still allowed.
    pub fn allows(&self, retry: u32) -> bool {
        retry <= self.max_retries
    }

    pub fn delay(&self) -> Duration {
        let jitter = if self.jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=self.jitter_ms)
        } else {
            0
        };
        Duration::from_millis(self.delay_ms.saturating_add(jitter))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServerConfig {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub ice_servers: Vec<IceServerConfig>,
    pub turn_relay_only: bool,
    pub data_channel_label: String,
    pub bandwidth_sample_interval_ms: u64,
    pub save_data: bool,
    /// ICE restart attempts after a connection drops.
    pub reconnect: RetryPolicy,
    /// Re-dial schedule for the signaling socket.
    pub signaling_retry: RetryPolicy,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![IceServerConfig::stun(DEFAULT_STUN_SERVER)],
            turn_relay_only: false,
            data_channel_label: TRADE_CHANNEL_LABEL.to_string(),
            bandwidth_sample_interval_ms: 5_000,
            save_data: false,
            reconnect: RetryPolicy {
                max_retries: 5,
                delay_ms: 2_000,
                jitter_ms: 500,
            },
            signaling_retry: RetryPolicy {
                max_retries: 10,
                delay_ms: 1_000,
                jitter_ms: 250,
            },
        }
    }
}

impl ConnectionConfig {
    pub fn bandwidth_sample_interval(&self) -> Duration {
        Duration::from_millis(self.bandwidth_sample_interval_ms.max(100))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TradeConfig {
    pub timeout_ms: u64,
    pub retry_count: u32,
    pub retry_delay_ms: u64,
    pub broadcast_immediately: bool,
}

impl Default for TradeConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 60_000,
            retry_count: 3,
            retry_delay_ms: 1_000,
            broadcast_immediately: false,
        }
    }
}

impl TradeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry_count, Duration::from_millis(self.retry_delay_ms))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub signaling_url: String,
    pub peer_id: Option<String>,
    pub connection: ConnectionConfig,
    pub trade: TradeConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            signaling_url: DEFAULT_SIGNALING_URL.to_string(),
            peer_id: None,
            connection: ConnectionConfig::default(),
            trade: TradeConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("dev", "swapline", "swapline")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Load the TOML file (an explicit path must exist; the default path is
    /// optional), then overlay `SWAPLINE_*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with(path, |key| std::env::var(key).ok())
    }

    /// [`NodeConfig::load`] with a caller-supplied environment.
    pub fn load_with<F>(path: Option<&Path>, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match Self::default_path() {
                Some(path) if path.exists() => Self::from_file(&path)?,
                _ => Self::default(),
            },
        };
        config.apply_env(lookup);
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(url) = var("SWAPLINE_SIGNALING_URL") {
            self.signaling_url = url;
        }
        if let Some(peer_id) = var("SWAPLINE_PEER_ID") {
            self.peer_id = Some(peer_id);
        }
        if let Some(servers) = var("SWAPLINE_ICE_SERVERS") {
            self.connection.ice_servers = servers
                .split(',')
                .map(str::trim)
                .filter(|url| !url.is_empty())
                .map(IceServerConfig::stun)
                .collect();
        }
        if let Some(flag) = var("SWAPLINE_TURN_RELAY_ONLY") {
            self.connection.turn_relay_only = parse_flag(&flag);
        }
        if let Some(flag) = var("SWAPLINE_SAVE_DATA") {
            self.connection.save_data = parse_flag(&flag);
        }
        if let Some(ms) = var("SWAPLINE_TRADE_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.trade.timeout_ms = ms;
        }
        if let Some(count) = var("SWAPLINE_TRADE_RETRY_COUNT").and_then(|v| v.parse().ok()) {
            self.trade.retry_count = count;
        }
        if let Some(ms) = var("SWAPLINE_TRADE_RETRY_DELAY_MS").and_then(|v| v.parse().ok()) {
            self.trade.retry_delay_ms = ms;
        }
        if let Some(flag) = var("SWAPLINE_BROADCAST_IMMEDIATELY") {
            self.trade.broadcast_immediately = parse_flag(&flag);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = Url::parse(&self.signaling_url).map_err(|err| {
            ConfigError::Invalid(format!("signaling url {}: {err}", self.signaling_url))
        })?;
        if !matches!(url.scheme(), "ws" | "wss" | "http" | "https") {
            return Err(ConfigError::Invalid(format!(
                "unsupported signaling scheme {}",
                url.scheme()
            )));
        }
        if self.trade.timeout_ms == 0 {
            return Err(ConfigError::Invalid("trade timeout must be positive".into()));
        }
        if self.connection.data_channel_label.trim().is_empty() {
            return Err(ConfigError::Invalid("data channel label is empty".into()));
        }
        if self.connection.turn_relay_only
            && !self
                .connection
                .ice_servers
                .iter()
                .flat_map(|server| server.urls.iter())
                .any(|url| url.starts_with("turn:") || url.starts_with("turns:"))
        {
            return Err(ConfigError::Invalid(
                "turn_relay_only requires at least one turn: server".into(),
            ));
        }
        Ok(())
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
