//! Peers: candidate endpoints and the order in which they are tried.

use std::cmp::Ordering;
use std::time::{Duration, Instant};

use reqwest::Url;

use crate::error::{Error, Result};
use crate::protocol::API_ROOT;

/// One remote endpoint able to accept transactions.
///
/// Ordering (the try order): oldest failure first (never failed sorts
/// before any failure), then the larger reported backlog, then URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    base_url: String,
    flow_file_count: i64,
    last_failure: Option<Instant>,
}

impl Peer {
    pub fn new(base_url: impl Into<String>, flow_file_count: i64) -> Self {
        Self {
            base_url: base_url.into(),
            flow_file_count,
            last_failure: None,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn flow_file_count(&self) -> i64 {
        self.flow_file_count
    }

    pub fn last_failure(&self) -> Option<Instant> {
        self.last_failure
    }

    pub fn mark_failure(&mut self) {
        self.mark_failure_at(Instant::now());
    }

    pub(crate) fn mark_failure_at(&mut self, at: Instant) {
        self.last_failure = Some(at);
    }

    /// Copy locally observed health from an earlier entry for the same URL.
    pub(crate) fn inherit_stats(&mut self, previous: &Peer) {
        self.flow_file_count = previous.flow_file_count;
        self.last_failure = previous.last_failure;
    }

    pub fn status(&self) -> PeerStatus {
        PeerStatus {
            url: self.base_url.clone(),
            flow_file_count: self.flow_file_count,
            failed_ago: self.last_failure.map(|t| t.elapsed()),
        }
    }
}

impl Ord for Peer {
    fn cmp(&self, other: &Self) -> Ordering {
        self.last_failure
            .cmp(&other.last_failure)
            .then_with(|| other.flow_file_count.cmp(&self.flow_file_count))
            .then_with(|| self.base_url.cmp(&other.base_url))
    }
}

impl PartialOrd for Peer {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Snapshot of one peer for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerStatus {
    pub url: String,
    pub flow_file_count: i64,
    /// Time since the last failure, if the peer ever failed.
    pub failed_ago: Option<Duration>,
}

/// Normalize a seed URL to `scheme://host:port/<api-root>`.
///
/// `http://nifi.local/nifi` becomes `http://nifi.local:80/nifi-api`.
pub fn normalize_base_url(url: &str) -> Result<String> {
    let invalid = |reason: &str| Error::InvalidUrl {
        url: url.to_string(),
        reason: reason.to_string(),
    };
    let parsed = Url::parse(url.trim()).map_err(|e| invalid(&e.to_string()))?;
    let scheme = parsed.scheme();
    if scheme != "http" && scheme != "https" {
        return Err(invalid("scheme must be http or https"));
    }
    let host = parsed.host_str().ok_or_else(|| invalid("missing host"))?;
    let port = parsed
        .port_or_known_default()
        .ok_or_else(|| invalid("missing port"))?;
    Ok(format!("{scheme}://{host}:{port}{API_ROOT}"))
}
