//! Client and delivery configuration.
//!
//! Loading and persisting these structs is the host's job; the core only
//! validates and consumes them. Durations are written in milliseconds.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::policy::{ExponentialBackoffPolicy, FixedDelayPolicy, OneShotPolicy, PollingPolicy};

/// Everything needed to build a [`crate::SiteToSiteClient`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientConfig {
    /// Seed peer URLs, e.g. `http://nifi.local:8080/nifi`.
    pub urls: Vec<String>,
    /// Input port name, resolved to an identifier once at client construction.
    pub port_name: Option<String>,
    /// Input port identifier; when set, no name lookup is made.
    pub port_identifier: Option<String>,
    /// Gzip the flow-file request body.
    pub use_compression: bool,
    pub timeout_ms: u64,
    pub connect_timeout_ms: u64,
    /// How old the peer list may get before a transaction refreshes it.
    pub peer_update_interval_ms: u64,
    pub batch_count: Option<u64>,
    pub batch_size: Option<u64>,
    pub batch_duration_ms: Option<u64>,
    pub request_expiration_ms: Option<u64>,
    pub tls: Option<TlsConfig>,
    pub proxy: Option<ProxyConfig>,
}

/// Client certificate material. Presence switches the transport to HTTPS.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TlsConfig {
    /// PEM file holding the client certificate chain followed by its private key.
    pub identity_pem: Option<PathBuf>,
    /// Extra CA certificate (PEM) to trust.
    pub ca_pem: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            urls: Vec::new(),
            port_name: None,
            port_identifier: None,
            use_compression: false,
            timeout_ms: 30_000,
            connect_timeout_ms: 10_000,
            peer_update_interval_ms: 60_000,
            batch_count: None,
            batch_size: None,
            batch_duration_ms: None,
            request_expiration_ms: None,
            tls: None,
            proxy: None,
        }
    }
}

impl ClientConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn peer_update_interval(&self) -> Duration {
        Duration::from_millis(self.peer_update_interval_ms)
    }

    pub fn is_secure(&self) -> bool {
        self.tls.is_some()
    }

    /// Reject configurations no client can be built from.
    pub fn validate(&self) -> Result<()> {
        if self.urls.is_empty() {
            return Err(Error::Config("at least one seed URL is required".into()));
        }
        if self.port_name.is_none() && self.port_identifier.is_none() {
            return Err(Error::Config(
                "either port_name or port_identifier is required".into(),
            ));
        }
        let wanted = if self.is_secure() { "https://" } else { "http://" };
        for url in &self.urls {
            if !url.to_ascii_lowercase().starts_with(wanted) {
                return Err(Error::SchemeMismatch {
                    url: url.clone(),
                    secure: self.is_secure(),
                });
            }
        }
        Ok(())
    }
}

/// Which [`PollingPolicy`] drives the delivery loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    FixedDelay,
    ExponentialBackoff,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeliveryConfig {
    /// Skip transaction creation when the collector returns nothing.
    pub skip_empty_batches: bool,
    pub policy: PolicyKind,
    pub delay_ms: u64,
    /// Consecutive failures tolerated before the loop stops.
    pub max_retries: u32,
    /// Upper bound for exponential backoff.
    pub max_delay_ms: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            skip_empty_batches: true,
            policy: PolicyKind::FixedDelay,
            delay_ms: 10_000,
            max_retries: 3,
            max_delay_ms: 300_000,
        }
    }
}

impl DeliveryConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    /// Build the configured policy.
    pub fn build_policy(&self) -> Box<dyn PollingPolicy> {
        match self.policy {
            PolicyKind::FixedDelay => Box::new(FixedDelayPolicy::new(self.delay(), self.max_retries)),
            PolicyKind::ExponentialBackoff => Box::new(ExponentialBackoffPolicy::new(
                self.delay(),
                Duration::from_millis(self.max_delay_ms),
                self.max_retries,
            )),
        }
    }

    /// Deliver once now, retrying failures with the configured policy.
    pub fn build_one_shot_policy(&self) -> Box<dyn PollingPolicy> {
        Box::new(OneShotPolicy::new(self.build_policy()))
    }
}
