//! FlowFile site-to-site client over HTTP.
//! Peer pool with health-ordered failover, framed and checksummed
//! transactions, and a policy-driven background delivery loop.

pub mod client;
pub mod config;
pub mod delivery;
pub mod error;
pub mod integrity;
pub mod packet;
pub mod peer;
pub mod policy;
pub mod protocol;
pub mod rest;
pub mod tracker;
pub mod transaction;
pub mod transport;
pub mod wire;

#[cfg(test)]
mod test_server;

pub use client::SiteToSiteClient;
pub use config::{ClientConfig, DeliveryConfig, PolicyKind, ProxyConfig, TlsConfig};
pub use delivery::{DataCollector, DeliveryController, DeliveryEvent, StopReason};
pub use error::{DeliveryError, Error, Result};
pub use packet::{ByteArrayDataPacket, DataPacket, EmptyDataPacket, FileDataPacket};
pub use peer::{Peer, PeerStatus};
pub use policy::{ExponentialBackoffPolicy, FixedDelayPolicy, OneShotPolicy, PollingPolicy};
pub use protocol::PROTOCOL_VERSION;
pub use transaction::{Transaction, TransactionCompletion, TransactionState};
