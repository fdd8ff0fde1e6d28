//! Application configuration loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

use relay::{DEFAULT_BATCH_SIZE, DEFAULT_DEAD_LETTER_TOPIC, DEFAULT_POLL_INTERVAL};

const DEFAULT_ALERT_CHANNEL: &str = "#saga-alerts";

/// Output format of the tracing subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl LogFormat {
    fn parse(value: &str) -> Self {
        if value.eq_ignore_ascii_case("json") {
            Self::Json
        } else {
            Self::Text
        }
    }
}

/// Server configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST`, `PORT`: bind address (default `0.0.0.0:3000`)
/// - `RUST_LOG`: tracing filter directive (default `info`)
/// - `LOG_FORMAT`: `text` or `json`
/// - `DATABASE_URL`: PostgreSQL URL; in-memory stores when unset
/// - `DATABASE_MAX_CONNECTIONS`: pool size (default 10)
/// - `CAPTURE_TOPIC_PREFIX`: prefix of capture and internal topics (default `chat`)
/// - `DEAD_LETTER_TOPIC`: default `chat.saga.dead-letter`
/// - `OUTBOX_POLL_INTERVAL_MS`, `OUTBOX_POLL_BATCH_SIZE`: poller cadence
/// - `OUTBOX_RETENTION_HOURS`: purge processed rows older than this; unset keeps them
/// - `ALERT_WEBHOOK_URL`: operator alert endpoint; alerts are only logged when unset
/// - `ALERT_CHANNEL`: default `#saga-alerts`
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub capture_topic_prefix: String,
    pub dead_letter_topic: String,
    pub outbox_poll_interval: Duration,
    pub outbox_poll_batch_size: usize,
    pub outbox_retention_hours: Option<u32>,
    pub alert_webhook_url: Option<String>,
    pub alert_channel: String,
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration from an arbitrary key lookup.
    ///
    /// Empty values count as unset. Values that fail to parse fall back to
    /// the default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        Self {
            host: get("HOST").unwrap_or(defaults.host),
            port: parsed(get("PORT")).unwrap_or(defaults.port),
            log_level: get("RUST_LOG").unwrap_or(defaults.log_level),
            log_format: get("LOG_FORMAT")
                .map(|v| LogFormat::parse(&v))
                .unwrap_or_default(),
            database_url: get("DATABASE_URL"),
            database_max_connections: parsed(get("DATABASE_MAX_CONNECTIONS"))
                .unwrap_or(defaults.database_max_connections),
            capture_topic_prefix: get("CAPTURE_TOPIC_PREFIX")
                .unwrap_or(defaults.capture_topic_prefix),
            dead_letter_topic: get("DEAD_LETTER_TOPIC").unwrap_or(defaults.dead_letter_topic),
            outbox_poll_interval: parsed(get("OUTBOX_POLL_INTERVAL_MS"))
                .map(Duration::from_millis)
                .unwrap_or(defaults.outbox_poll_interval),
            outbox_poll_batch_size: parsed(get("OUTBOX_POLL_BATCH_SIZE"))
                .unwrap_or(defaults.outbox_poll_batch_size),
            outbox_retention_hours: parsed(get("OUTBOX_RETENTION_HOURS")),
            alert_webhook_url: get("ALERT_WEBHOOK_URL"),
            alert_channel: get("ALERT_CHANNEL").unwrap_or(defaults.alert_channel),
        }
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parsed<T: FromStr>(value: Option<String>) -> Option<T> {
    value.and_then(|v| v.trim().parse().ok())
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            database_url: None,
            database_max_connections: 10,
            capture_topic_prefix: "chat".to_string(),
            dead_letter_topic: DEFAULT_DEAD_LETTER_TOPIC.to_string(),
            outbox_poll_interval: DEFAULT_POLL_INTERVAL,
            outbox_poll_batch_size: DEFAULT_BATCH_SIZE,
            outbox_retention_hours: None,
            alert_webhook_url: None,
            alert_channel: DEFAULT_ALERT_CHANNEL.to_string(),
        }
    }
}
