//! Per-peer REST calls of the site-to-site HTTP protocol.

use std::time::Duration;

use reqwest::blocking::Response;
use reqwest::header::{CONTENT_TYPE, LOCATION};
use reqwest::Method;

use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::protocol::{
    self, ControllerEntity, PeerDto, PeersEntity, PortDto, ResponseCode, TransactionResultEntity,
    CONTENT_TYPE_OCTET_STREAM, HEADER_BATCH_COUNT, HEADER_BATCH_DURATION, HEADER_BATCH_SIZE,
    HEADER_LOCATION_URI_INTENT, HEADER_REQUEST_EXPIRATION, HEADER_SERVER_TRANSACTION_TTL,
    HEADER_USE_COMPRESSION, LOCATION_URI_INTENT_VALUE,
};
use crate::transport::RequestManager;

/// Hints sent when a transaction is opened.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandshakeProperties {
    pub use_compression: bool,
    pub batch_count: Option<u64>,
    pub batch_size: Option<u64>,
    pub batch_duration_ms: Option<u64>,
    pub request_expiration_ms: Option<u64>,
}

impl HandshakeProperties {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            use_compression: config.use_compression,
            batch_count: config.batch_count,
            batch_size: config.batch_size,
            batch_duration_ms: config.batch_duration_ms,
            request_expiration_ms: config.request_expiration_ms,
        }
    }

    fn headers(&self) -> Vec<(&'static str, String)> {
        let mut out = vec![(HEADER_USE_COMPRESSION, self.use_compression.to_string())];
        let optional = [
            (HEADER_BATCH_COUNT, self.batch_count),
            (HEADER_BATCH_SIZE, self.batch_size),
            (HEADER_BATCH_DURATION, self.batch_duration_ms),
            (HEADER_REQUEST_EXPIRATION, self.request_expiration_ms),
        ];
        for (name, value) in optional {
            if let Some(v) = value {
                out.push((name, v.to_string()));
            }
        }
        out
    }
}

/// Where a newly opened transaction lives on the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionLocation {
    pub url: String,
    /// Server-side time to live, when the server reports one.
    pub ttl: Option<Duration>,
}

/// `GET {base}/site-to-site/peers`.
pub fn fetch_peers(transport: &RequestManager, base_url: &str) -> Result<Vec<PeerDto>> {
    let url = format!("{base_url}{}", protocol::PEERS_PATH);
    let response = transport.open_connection(&url, &[], &[], Method::GET)?.send()?;
    let response = require_success(response, "peer listing")?;
    let entity: PeersEntity = serde_json::from_str(&response.text()?)?;
    Ok(entity.peers)
}

/// `GET {base}/site-to-site`: the input ports of the remote controller.
pub fn fetch_input_ports(transport: &RequestManager, base_url: &str) -> Result<Vec<PortDto>> {
    let url = format!("{base_url}{}", protocol::CONTROLLER_PATH);
    let response = transport.open_connection(&url, &[], &[], Method::GET)?.send()?;
    let response = require_success(response, "controller lookup")?;
    let entity: ControllerEntity = serde_json::from_str(&response.text()?)?;
    Ok(entity.controller.input_ports)
}

/// `POST {base}/data-transfer/input-ports/{port}/transactions`.
///
/// `Ok(None)` when the peer answered 2xx without asserting that `Location`
/// is a transaction URL: the port does not accept a transaction right now.
pub fn initiate_transaction(
    transport: &RequestManager,
    base_url: &str,
    port_identifier: &str,
    handshake: &HandshakeProperties,
) -> Result<Option<TransactionLocation>> {
    let url = format!("{base_url}{}", protocol::transactions_path(port_identifier));
    let owned = handshake.headers();
    let headers: Vec<(&str, &str)> = owned.iter().map(|(k, v)| (*k, v.as_str())).collect();
    let response = transport
        .open_connection(&url, &headers, &[], Method::POST)?
        .send()?;
    let response = require_success(response, "transaction create")?;

    let header = |name: &str| {
        response
            .headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    let intent = header(HEADER_LOCATION_URI_INTENT);
    let location = header(LOCATION.as_str());
    let ttl = header(HEADER_SERVER_TRANSACTION_TTL)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs);

    match (intent.as_deref(), location) {
        (Some(LOCATION_URI_INTENT_VALUE), Some(url)) => Ok(Some(TransactionLocation { url, ttl })),
        _ => {
            tracing::debug!(%url, "peer did not hand out a transaction URL");
            Ok(None)
        }
    }
}

/// `DELETE {transaction}?responseCode={code}`.
///
/// Returns the server's transaction result when it sent one as JSON.
pub fn end_transaction(
    transport: &RequestManager,
    transaction_url: &str,
    code: ResponseCode,
) -> Result<Option<TransactionResultEntity>> {
    let code_value = code.code().to_string();
    let response = transport
        .open_connection(
            transaction_url,
            &[(CONTENT_TYPE.as_str(), CONTENT_TYPE_OCTET_STREAM)],
            &[("responseCode", code_value.as_str())],
            Method::DELETE,
        )?
        .send()?;
    let response = require_success(response, "transaction end")?;
    let body = response.text()?;
    Ok(serde_json::from_str(&body).ok())
}

/// Turn a non-2xx response into a protocol error.
pub fn require_success(response: Response, what: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        let body = response.text().unwrap_or_default();
        Err(Error::Protocol(format!(
            "{what} returned {status}: {}",
            body.trim()
        )))
    }
}
