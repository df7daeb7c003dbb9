use casefeed_core::wire::DEFAULT_MAX_FRAME_BYTES;
use std::time::Duration;
use thiserror::Error;
use url::Url;

pub const DEFAULT_URL: &str = "ws://127.0.0.1:8000/ws/timeline";
pub const DEFAULT_CAPACITY: usize = 1000;
pub const DEFAULT_HEARTBEAT_SECS: u64 = 30;
pub const DEFAULT_MAX_MISSED_HEARTBEATS: u32 = 3;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_BACKOFF_BASE_MS: u64 = 1_000;
pub const DEFAULT_BACKOFF_CAP_MS: u64 = 30_000;
pub const DEFAULT_BACKOFF_JITTER: f64 = 0.2;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: '{value}'")]
    InvalidValue { key: &'static str, value: String },
    #[error("invalid url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("backoff base {base:?} exceeds cap {cap:?}")]
    BackoffBaseAboveCap { base: Duration, cap: Duration },
    #[error("backoff jitter must be within [0, 1], got {0}")]
    JitterOutOfRange(f64),
}

#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    pub base: Duration,
    pub cap: Duration,
    /// Fraction of the nominal delay added as random jitter.
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(DEFAULT_BACKOFF_BASE_MS),
            cap: Duration::from_millis(DEFAULT_BACKOFF_CAP_MS),
            jitter: DEFAULT_BACKOFF_JITTER,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    pub url: Url,
    pub capacity: usize,
    pub heartbeat_interval: Duration,
    pub max_missed_heartbeats: u32,
    pub connect_timeout: Duration,
    pub backoff: BackoffConfig,
    pub max_frame_bytes: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            url: Url::parse(DEFAULT_URL).expect("default url is valid"),
            capacity: DEFAULT_CAPACITY,
            heartbeat_interval: Duration::from_secs(DEFAULT_HEARTBEAT_SECS),
            max_missed_heartbeats: DEFAULT_MAX_MISSED_HEARTBEATS,
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            backoff: BackoffConfig::default(),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for the
    /// `CASEFEED_*` keys. Blank values are treated as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        let mut config = Self::default();

        if let Some(value) = get("CASEFEED_URL") {
            config.url = parse_url(&value)?;
        }
        if let Some(value) = get("CASEFEED_CAPACITY") {
            config.capacity = parse_number("CASEFEED_CAPACITY", &value)?;
        }
        if let Some(value) = get("CASEFEED_HEARTBEAT_SECS") {
            config.heartbeat_interval =
                Duration::from_secs(parse_number("CASEFEED_HEARTBEAT_SECS", &value)?);
        }
        if let Some(value) = get("CASEFEED_HEARTBEAT_MISSES") {
            config.max_missed_heartbeats = parse_number("CASEFEED_HEARTBEAT_MISSES", &value)?;
        }
        if let Some(value) = get("CASEFEED_CONNECT_TIMEOUT_SECS") {
            config.connect_timeout =
                Duration::from_secs(parse_number("CASEFEED_CONNECT_TIMEOUT_SECS", &value)?);
        }
        if let Some(value) = get("CASEFEED_BACKOFF_BASE_MS") {
            config.backoff.base =
                Duration::from_millis(parse_number("CASEFEED_BACKOFF_BASE_MS", &value)?);
        }
        if let Some(value) = get("CASEFEED_BACKOFF_CAP_MS") {
            config.backoff.cap =
                Duration::from_millis(parse_number("CASEFEED_BACKOFF_CAP_MS", &value)?);
        }
        if let Some(value) = get("CASEFEED_BACKOFF_JITTER") {
            config.backoff.jitter = parse_number("CASEFEED_BACKOFF_JITTER", &value)?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capacity == 0 {
            return Err(ConfigError::Zero("capacity"));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::Zero("heartbeat_interval"));
        }
        if self.max_missed_heartbeats == 0 {
            return Err(ConfigError::Zero("max_missed_heartbeats"));
        }
        if self.connect_timeout.is_zero() {
            return Err(ConfigError::Zero("connect_timeout"));
        }
        if self.max_frame_bytes == 0 {
            return Err(ConfigError::Zero("max_frame_bytes"));
        }
        if self.backoff.base.is_zero() {
            return Err(ConfigError::Zero("backoff.base"));
        }
        if self.backoff.base > self.backoff.cap {
            return Err(ConfigError::BackoffBaseAboveCap {
                base: self.backoff.base,
                cap: self.backoff.cap,
            });
        }
        if !(0.0..=1.0).contains(&self.backoff.jitter) {
            return Err(ConfigError::JitterOutOfRange(self.backoff.jitter));
        }
        Ok(())
    }
}

pub fn parse_url(value: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(value.trim()).map_err(|err| ConfigError::InvalidUrl {
        url: value.to_string(),
        reason: err.to_string(),
    })?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        other => Err(ConfigError::InvalidUrl {
            url: value.to_string(),
            reason: format!("unsupported scheme '{other}'"),
        }),
    }
}

fn parse_number<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse::<T>()
        .map_err(|_| ConfigError::InvalidValue {
            key,
            value: value.to_string(),
        })
}
