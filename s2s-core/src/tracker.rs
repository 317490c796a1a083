//! Peer tracker: the ordered pool of candidate peers, refreshed from the
//! remote peer listing, handing out transactions with failover.
//!
//! Every public operation runs under one mutex. Calls are network-bound and
//! infrequent, so the whole call is the critical section.

use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::peer::{normalize_base_url, Peer, PeerStatus};
use crate::protocol::PeerDto;
use crate::rest::{self, HandshakeProperties};
use crate::transaction::Transaction;
use crate::transport::RequestManager;

struct PeerPool {
    /// Always sorted in try order.
    peers: Vec<Peer>,
    /// Seed URLs; never evicted by a refresh.
    bootstrap: BTreeSet<String>,
    last_refresh: Option<Instant>,
}

impl PeerPool {
    fn urls(&self) -> Vec<String> {
        self.peers.iter().map(|p| p.base_url().to_string()).collect()
    }

    fn mark_failure(&mut self, url: &str) {
        if let Some(peer) = self.peers.iter_mut().find(|p| p.base_url() == url) {
            peer.mark_failure();
        }
    }

    fn sort(&mut self) {
        self.peers.sort();
    }
}

pub struct PeerTracker {
    transport: Arc<RequestManager>,
    handshake: HandshakeProperties,
    update_interval: Duration,
    pool: Mutex<PeerPool>,
}

impl PeerTracker {
    /// Build the pool from seed URLs, normalized to `scheme://host:port/nifi-api`.
    pub fn new(
        seeds: &[String],
        transport: Arc<RequestManager>,
        handshake: HandshakeProperties,
        update_interval: Duration,
    ) -> Result<Self> {
        let mut bootstrap = BTreeSet::new();
        for seed in seeds {
            bootstrap.insert(normalize_base_url(seed)?);
        }
        if bootstrap.is_empty() {
            return Err(Error::NoPeers);
        }
        let mut peers: Vec<Peer> = bootstrap.iter().map(|url| Peer::new(url.as_str(), 0)).collect();
        peers.sort();
        Ok(Self {
            transport,
            handshake,
            update_interval,
            pool: Mutex::new(PeerPool {
                peers,
                bootstrap,
                last_refresh: None,
            }),
        })
    }

    /// Sorted snapshot of the pool.
    pub fn peers(&self) -> Vec<PeerStatus> {
        self.lock().peers.iter().map(Peer::status).collect()
    }

    /// Replace the pool with the listing of the first peer that answers.
    ///
    /// Known peers keep their locally observed stats; seeds missing from the
    /// listing are kept. Fails with the last error only if no peer answered.
    pub fn refresh_peers(&self) -> Result<()> {
        let mut pool = self.lock();
        self.refresh_locked(&mut pool)
    }

    /// Open a transaction on the first peer that grants one, in pool order.
    ///
    /// Failing peers are marked so they sort later next time. `Ok(None)` when
    /// no peer failed but none handed out a transaction URL.
    pub fn create_transaction(&self, port_identifier: &str) -> Result<Option<Transaction>> {
        let mut pool = self.lock();
        if self.is_stale(&pool) {
            if let Err(e) = self.refresh_locked(&mut pool) {
                tracing::warn!(error = %e, "peer refresh failed, using known peers");
            }
        }

        let mut last_err = None;
        for url in pool.urls() {
            match rest::initiate_transaction(&self.transport, &url, port_identifier, &self.handshake) {
                Ok(Some(location)) => {
                    if last_err.is_some() {
                        pool.sort();
                    }
                    tracing::info!(peer = %url, transaction = %location.url, "transaction created");
                    return Ok(Some(Transaction::new(
                        self.transport.clone(),
                        location.url,
                        self.handshake.use_compression,
                        location.ttl,
                    )));
                }
                Ok(None) => {
                    tracing::debug!(peer = %url, port = port_identifier, "peer offered no transaction");
                }
                Err(e) => {
                    tracing::warn!(peer = %url, error = %e, connect = e.is_connection(), "transaction create failed, marking peer");
                    pool.mark_failure(&url);
                    last_err = Some(e);
                }
            }
        }
        pool.sort();
        match last_err {
            Some(e) => Err(e),
            None => Ok(None),
        }
    }

    /// Look up the identifier of the input port named `port_name`.
    pub fn resolve_port_identifier(&self, port_name: &str) -> Result<String> {
        let mut pool = self.lock();
        let mut last_err = None;
        for url in pool.urls() {
            match rest::fetch_input_ports(&self.transport, &url) {
                Ok(ports) => {
                    if last_err.is_some() {
                        pool.sort();
                    }
                    return ports
                        .into_iter()
                        .find(|p| p.name == port_name)
                        .map(|p| p.id)
                        .ok_or_else(|| Error::PortNotFound(port_name.to_string()));
                }
                Err(e) => {
                    tracing::warn!(peer = %url, error = %e, "port lookup failed, marking peer");
                    pool.mark_failure(&url);
                    last_err = Some(e);
                }
            }
        }
        pool.sort();
        Err(last_err.unwrap_or(Error::NoPeers))
    }

    fn lock(&self) -> MutexGuard<'_, PeerPool> {
        self.pool.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_stale(&self, pool: &PeerPool) -> bool {
        match pool.last_refresh {
            None => true,
            Some(at) => at.elapsed() >= self.update_interval,
        }
    }

    fn refresh_locked(&self, pool: &mut PeerPool) -> Result<()> {
        let mut last_err = None;
        for url in pool.urls() {
            match rest::fetch_peers(&self.transport, &url) {
                Ok(listing) => {
                    pool.peers = self.merge(&pool.peers, &pool.bootstrap, listing);
                    pool.last_refresh = Some(Instant::now());
                    tracing::info!(source = %url, peers = pool.peers.len(), "peer list refreshed");
                    return Ok(());
                }
                Err(e) => {
                    tracing::debug!(peer = %url, error = %e, "peer listing failed");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or(Error::NoPeers))
    }

    fn merge(&self, old: &[Peer], bootstrap: &BTreeSet<String>, listing: Vec<PeerDto>) -> Vec<Peer> {
        let secure = self.transport.is_secure();
        let mut seen = HashSet::new();
        let mut next = Vec::new();
        for dto in listing {
            if dto.secure != secure {
                tracing::debug!(host = %dto.hostname, port = dto.port, "skipping peer with other transport security");
                continue;
            }
            let url = dto.base_url();
            if !seen.insert(url.clone()) {
                continue;
            }
            // Reported counts are not trusted; new peers start from zero.
            let mut peer = Peer::new(url, 0);
            if let Some(previous) = old.iter().find(|p| p.base_url() == peer.base_url()) {
                peer.inherit_stats(previous);
            }
            next.push(peer);
        }
        for url in bootstrap {
            if seen.contains(url) {
                continue;
            }
            let kept = old
                .iter()
                .find(|p| p.base_url() == url)
                .cloned()
                .unwrap_or_else(|| Peer::new(url.as_str(), 0));
            next.push(kept);
        }
        next.sort();
        next
    }
}
