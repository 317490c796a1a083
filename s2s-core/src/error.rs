//! Error types for s2s-core.

use thiserror::Error;

/// Result type for s2s-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the transport, peer tracker, client and transactions.
#[derive(Debug, Error)]
pub enum Error {
    /// The HTTP client failed to reach a peer (DNS, TLS, refused, timeout).
    #[error("connection error: {0}")]
    Connection(#[from] reqwest::Error),

    /// Reading a packet stream or writing a frame failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer answered, but not the way the protocol requires.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A JSON document from the peer could not be parsed.
    #[error("malformed response: {0}")]
    Json(#[from] serde_json::Error),

    /// Server checksum disagrees with the locally computed one.
    #[error("checksum mismatch: local {local}, server {server}")]
    Integrity { local: u32, server: u64 },

    /// URL scheme does not match the configured transport security.
    #[error("scheme of {url} does not match transport (secure = {secure})")]
    SchemeMismatch { url: String, secure: bool },

    #[error("invalid URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    /// The port directory has no input port with the requested name.
    #[error("no input port named {0:?}")]
    PortNotFound(String),

    /// The tracker has no peers to try.
    #[error("no peers available")]
    NoPeers,

    /// Operation not allowed in the transaction's current state.
    #[error("invalid transaction state: {operation} not allowed while {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// The underlying cause never reached the peer's HTTP layer.
    pub fn is_connection(&self) -> bool {
        matches!(self, Error::Connection(e) if e.is_connect() || e.is_timeout())
    }

    /// Unwraps an I/O error that merely carries another error of ours, e.g. a
    /// packet source failure surfaced through the framing writer.
    pub(crate) fn from_io(err: std::io::Error) -> Self {
        if err.get_ref().map(|inner| inner.is::<Error>()).unwrap_or(false) {
            if let Some(inner) = err.into_inner() {
                if let Ok(ours) = inner.downcast::<Error>() {
                    return *ours;
                }
            }
            return Error::Protocol("wrapped error lost".into());
        }
        Error::Io(err)
    }
}

/// Failure of one delivery cycle, split by the retry path it feeds.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("transaction create failed: {0}")]
    Create(#[source] Error),

    #[error("transaction send failed: {0}")]
    Send(#[source] Error),
}

impl DeliveryError {
    pub fn inner(&self) -> &Error {
        match self {
            DeliveryError::Create(e) | DeliveryError::Send(e) => e,
        }
    }
}
