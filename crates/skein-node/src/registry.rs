//! Outbound peer links keyed by (host, port)

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use skein_core::PeerKey;
use skein_transport::Socket;

use crate::PeerConnection;

/// Owns every outbound link of a node
#[derive(Default)]
pub struct ConnectionRegistry {
    peers: RwLock<HashMap<PeerKey, Arc<PeerConnection>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `peer`, returning the link it replaced
    pub fn insert(&self, peer: Arc<PeerConnection>) -> Option<Arc<PeerConnection>> {
        self.peers.write().insert(peer.key().clone(), peer)
    }

    /// Remove `peer` only if it is still the registered link for its key
    pub fn remove_if_same(&self, peer: &Arc<PeerConnection>) -> bool {
        let mut peers = self.peers.write();
        match peers.get(peer.key()) {
            Some(current) if Arc::ptr_eq(current, peer) => {
                peers.remove(peer.key());
                true
            }
            _ => false,
        }
    }

    pub fn snapshot(&self) -> Vec<Arc<PeerConnection>> {
        self.peers.read().values().cloned().collect()
    }

    /// Sockets of every registered link
    pub fn sockets(&self) -> Vec<Arc<Socket>> {
        self.peers
            .read()
            .values()
            .map(|peer| Arc::clone(peer.socket()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }
}
