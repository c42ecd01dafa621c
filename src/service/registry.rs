//! Server-side table of live connections, keyed by connection key.

use crate::config::DuplicateKeyPolicy;
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::message::Message;
use crate::service::endpoint::Peer;
use crate::utils::metrics::global_metrics;
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::{debug, info, warn};

/// Outcome of a broadcast
#[derive(Debug, Default)]
pub struct BroadcastReport {
    /// Peers the message was written to
    pub delivered: usize,
    /// Peers whose send failed, with the failure
    pub failures: Vec<(String, ProtocolError)>,
}

impl BroadcastReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Connection registry
pub struct ConnectionRegistry {
    peers: RwLock<HashMap<String, Peer>>,
    policy: DuplicateKeyPolicy,
    max_connections: usize,
}

impl ConnectionRegistry {
    pub fn new(policy: DuplicateKeyPolicy, max_connections: usize) -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
            policy,
            max_connections,
        }
    }

    /// Check whether a connection announcing `key` would be accepted.
    ///
    /// The server runs this before acknowledging a handshake; [`add`] repeats
    /// the check atomically with the insert.
    ///
    /// [`add`]: ConnectionRegistry::add
    pub fn admit(&self, key: &str) -> Result<()> {
        let peers = self
            .peers
            .read()
            .map_err(|_| ProtocolError::Custom(constants::ERR_REGISTRY_LOCK.into()))?;
        self.check(&peers, key)
    }

    /// Register `peer` under its key.
    ///
    /// With [`DuplicateKeyPolicy::ReplaceExisting`] the superseded peer is
    /// returned so the caller can close it. With [`DuplicateKeyPolicy::Reject`]
    /// a live key fails with [`ProtocolError::DuplicateConnection`].
    pub fn add(&self, peer: Peer) -> Result<Option<Peer>> {
        let mut peers = self
            .peers
            .write()
            .map_err(|_| ProtocolError::Custom(constants::ERR_REGISTRY_LOCK.into()))?;
        self.check(&peers, peer.key())?;

        let key = peer.key().to_string();
        let replaced = peers.insert(key.clone(), peer);
        match &replaced {
            Some(old) => info!(key, replaced = old.id(), "Connection replaced"),
            None => debug!(key, "Connection registered"),
        }
        Ok(replaced)
    }

    fn check(&self, peers: &HashMap<String, Peer>, key: &str) -> Result<()> {
        let existing = peers.contains_key(key);
        if existing && self.policy == DuplicateKeyPolicy::Reject {
            warn!(key, "Connection key already registered");
            return Err(ProtocolError::DuplicateConnection(key.to_string()));
        }
        if !existing && peers.len() >= self.max_connections {
            warn!(key, max = self.max_connections, "Connection limit reached");
            return Err(ProtocolError::TransportError(
                constants::ERR_TOO_MANY_CONNECTIONS.into(),
            ));
        }
        Ok(())
    }

    /// Remove `key` if it still belongs to connection `connection_id`.
    ///
    /// A connection that was replaced under the same key must not evict its
    /// successor when it shuts down.
    pub fn remove(&self, key: &str, connection_id: u64) -> bool {
        let Ok(mut peers) = self.peers.write() else {
            warn!(key, "{}", constants::ERR_REGISTRY_LOCK);
            return false;
        };
        if peers.get(key).is_some_and(|peer| peer.id() == connection_id) {
            peers.remove(key);
            debug!(key, connection_id, "Connection unregistered");
            true
        } else {
            false
        }
    }

    /// Look up a live connection
    pub fn get(&self, key: &str) -> Result<Peer> {
        let peers = self
            .peers
            .read()
            .map_err(|_| ProtocolError::Custom(constants::ERR_REGISTRY_LOCK.into()))?;
        peers.get(key).cloned().ok_or_else(|| {
            global_metrics().unknown_target();
            ProtocolError::UnknownTarget(key.to_string())
        })
    }

    /// Send to one connection
    pub async fn send_to(&self, key: &str, msg: &Message) -> Result<()> {
        let peer = self.get(key).inspect_err(|_| {
            warn!(key, code = msg.code(), "Send to unknown connection key");
        })?;
        peer.send(msg).await
    }

    /// Send to every registered connection.
    ///
    /// Sends run concurrently; a failing peer is recorded and does not stop
    /// delivery to the others.
    pub async fn broadcast(&self, msg: &Message) -> BroadcastReport {
        let peers = self.snapshot();
        let sends = peers.iter().map(|peer| async move {
            (peer.key().to_string(), peer.send(msg).await)
        });

        let mut report = BroadcastReport::default();
        for (key, outcome) in futures::future::join_all(sends).await {
            match outcome {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    warn!(key, error = %e, code = msg.code(), "Broadcast delivery failed");
                    report.failures.push((key, e));
                }
            }
        }
        debug!(
            code = msg.code(),
            delivered = report.delivered,
            failed = report.failures.len(),
            "Broadcast complete"
        );
        report
    }

    /// Keys of every live connection
    pub fn keys(&self) -> Vec<String> {
        self.peers
            .read()
            .map(|peers| peers.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.peers.read().map(|peers| peers.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove and return every connection
    pub fn drain(&self) -> Vec<Peer> {
        self.peers
            .write()
            .map(|mut peers| peers.drain().map(|(_, peer)| peer).collect())
            .unwrap_or_default()
    }

    fn snapshot(&self) -> Vec<Peer> {
        self.peers
            .read()
            .map(|peers| peers.values().cloned().collect())
            .unwrap_or_default()
    }
}
