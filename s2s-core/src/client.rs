//! Site-to-site client: the entry point hosts build once and share.

use std::sync::Arc;

use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::peer::PeerStatus;
use crate::rest::HandshakeProperties;
use crate::tracker::PeerTracker;
use crate::transaction::Transaction;
use crate::transport::RequestManager;

/// Sends flow files to one remote input port through a pool of peers.
///
/// Cheap to share behind an `Arc`; every call takes the tracker lock for
/// its duration.
pub struct SiteToSiteClient {
    tracker: PeerTracker,
    port_identifier: String,
}

impl SiteToSiteClient {
    /// Validate `config`, build the transport and peer pool, and resolve the
    /// input port identifier (by name, unless one is configured).
    pub fn new(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let transport = Arc::new(RequestManager::new(&config)?);
        let tracker = PeerTracker::new(
            &config.urls,
            transport,
            HandshakeProperties::from_config(&config),
            config.peer_update_interval(),
        )?;

        let port_identifier = match (config.port_identifier, config.port_name) {
            (Some(id), _) => id,
            (None, Some(name)) => {
                let id = tracker.resolve_port_identifier(&name)?;
                tracing::info!(port = %name, id = %id, "resolved input port");
                id
            }
            (None, None) => {
                return Err(Error::Config(
                    "either port_name or port_identifier is required".into(),
                ))
            }
        };

        Ok(Self {
            tracker,
            port_identifier,
        })
    }

    /// Open a transaction on the healthiest peer that accepts one.
    ///
    /// `Ok(None)` when peers answered but none offered a transaction.
    pub fn create_transaction(&self) -> Result<Option<Transaction>> {
        self.tracker.create_transaction(&self.port_identifier)
    }

    pub fn port_identifier(&self) -> &str {
        &self.port_identifier
    }

    pub fn refresh_peers(&self) -> Result<()> {
        self.tracker.refresh_peers()
    }

    pub fn peers(&self) -> Vec<PeerStatus> {
        self.tracker.peers()
    }
}
