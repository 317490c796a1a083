//! Site-to-site HTTP protocol: header names, endpoint paths, response codes
//! and the JSON documents exchanged with a remote instance.

use serde::Deserialize;

/// Protocol version sent on every request.
pub const PROTOCOL_VERSION: &str = "5";

/// API root appended to every normalized peer base URL.
pub const API_ROOT: &str = "/nifi-api";

pub const HEADER_PROTOCOL_VERSION: &str = "x-nifi-site-to-site-protocol-version";
pub const HEADER_LOCATION_URI_INTENT: &str = "x-location-uri-intent";
pub const LOCATION_URI_INTENT_VALUE: &str = "transaction-url";
pub const HEADER_SERVER_TRANSACTION_TTL: &str = "x-nifi-site-to-site-server-transaction-ttl";
pub const HEADER_USE_COMPRESSION: &str = "x-nifi-site-to-site-use-compression";
pub const HEADER_REQUEST_EXPIRATION: &str = "x-nifi-site-to-site-request-expiration";
pub const HEADER_BATCH_COUNT: &str = "x-nifi-site-to-site-batch-count";
pub const HEADER_BATCH_SIZE: &str = "x-nifi-site-to-site-batch-size";
pub const HEADER_BATCH_DURATION: &str = "x-nifi-site-to-site-batch-duration";

pub const CONTENT_TYPE_OCTET_STREAM: &str = "application/octet-stream";
pub const CONTENT_TYPE_JSON: &str = "application/json";
pub const CONTENT_TYPE_TEXT: &str = "text/plain";

/// Path of the peer listing below a peer base URL.
pub const PEERS_PATH: &str = "/site-to-site/peers";
/// Path of the controller document (port directory) below a peer base URL.
pub const CONTROLLER_PATH: &str = "/site-to-site";

/// `POST` target that opens a transaction on an input port.
pub fn transactions_path(port_identifier: &str) -> String {
    format!("/data-transfer/input-ports/{port_identifier}/transactions")
}

/// Reason codes carried by the end-of-transaction `DELETE`.
/// Values are fixed by the server's enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseCode {
    ConfirmTransaction,
    CancelTransaction,
    BadChecksum,
}

impl ResponseCode {
    pub fn code(self) -> u8 {
        match self {
            ResponseCode::ConfirmTransaction => 12,
            ResponseCode::CancelTransaction => 15,
            ResponseCode::BadChecksum => 19,
        }
    }
}

impl std::fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ResponseCode::ConfirmTransaction => "CONFIRM_TRANSACTION",
            ResponseCode::CancelTransaction => "CANCEL_TRANSACTION",
            ResponseCode::BadChecksum => "BAD_CHECKSUM",
        };
        write!(f, "{name}({})", self.code())
    }
}

/// Body of `GET /site-to-site/peers`.
#[derive(Debug, Clone, Deserialize)]
pub struct PeersEntity {
    #[serde(default)]
    pub peers: Vec<PeerDto>,
}

/// One entry of the peer listing.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerDto {
    pub hostname: String,
    pub port: u16,
    #[serde(default)]
    pub secure: bool,
    #[serde(default)]
    pub flow_file_count: i64,
}

impl PeerDto {
    /// Base URL of this peer, in the same normalized form as seed URLs.
    pub fn base_url(&self) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        format!("{scheme}://{}:{}{API_ROOT}", self.hostname, self.port)
    }
}

/// Body of `GET /site-to-site`.
#[derive(Debug, Clone, Deserialize)]
pub struct ControllerEntity {
    pub controller: ControllerDto,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerDto {
    #[serde(default)]
    pub input_ports: Vec<PortDto>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PortDto {
    pub id: String,
    pub name: String,
}

/// Body the server may return from the end-of-transaction `DELETE`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionResultEntity {
    #[serde(default)]
    pub response_code: Option<i32>,
    #[serde(default)]
    pub flow_file_sent: Option<u64>,
    #[serde(default)]
    pub message: Option<String>,
}
