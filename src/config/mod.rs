//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing or
//! malformed. The broker URL is wrapped in secrecy::SecretString to prevent
//! log leaks.

pub mod secrets;

use std::str::FromStr;
use std::time::Duration;

use crate::engine::{AckPolicy, FeedConfig};
use crate::error::{Error, Result};
use crate::queue::{ConnectOptions, QueueBackend};
use crate::source::SourceSettings;
use secrecy::SecretString;

#[derive(Debug)]
pub struct Config {
    pub queue_backend: QueueBackend,
    pub queue_url: SecretString,
    /// Component identifier; names the default queue and the broker connection.
    pub feed_name: String,
    pub queue_name: Option<String>,
    pub ack_policy: AckPolicy,
    pub requeue_failed: bool,
    pub min_idle_poll: Duration,
    pub fetch_timeout: Duration,
    /// Overrides the lease renewal period derived from the visibility timeout.
    pub lease_renewal: Option<Duration>,
    pub visibility_timeout: i32,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            queue_backend: parsed_var("QUEUE_BACKEND")?.unwrap_or_default(),
            queue_url: SecretString::from(required_var("QUEUE_URL")?),
            feed_name: std::env::var("FEED_NAME").unwrap_or_else(|_| "workfeed".to_string()),
            queue_name: std::env::var("FEED_QUEUE").ok().filter(|q| !q.is_empty()),
            ack_policy: parsed_var("FEED_ACK_POLICY")?.unwrap_or_default(),
            requeue_failed: parsed_var("FEED_REQUEUE_FAILED")?.unwrap_or(false),
            min_idle_poll: Duration::from_millis(parsed_var("FEED_MIN_IDLE_POLL_MS")?.unwrap_or(500)),
            fetch_timeout: Duration::from_millis(parsed_var("FEED_FETCH_TIMEOUT_MS")?.unwrap_or(5000)),
            lease_renewal: parsed_var("FEED_LEASE_RENEWAL_MS")?.map(Duration::from_millis),
            visibility_timeout: parsed_var("PGMQ_VISIBILITY_TIMEOUT")?.unwrap_or(60),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }

    pub fn source_settings(&self) -> SourceSettings {
        SourceSettings {
            identifier: self.feed_name.clone(),
            queue_name: self.queue_name.clone(),
            fetch_timeout: self.fetch_timeout,
        }
    }

    pub fn feed_config(&self) -> FeedConfig {
        FeedConfig {
            ack_policy: self.ack_policy,
            requeue_failed: self.requeue_failed,
            min_idle_poll: self.min_idle_poll,
            lease_renewal: self.lease_renewal,
        }
    }

    pub fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            connection_name: self.feed_name.clone(),
            visibility_timeout: self.visibility_timeout,
        }
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

fn parsed_var<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| Error::Config(format!("invalid value for {name}: {e}"))),
        Err(_) => Ok(None),
    }
}
