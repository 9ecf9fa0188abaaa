use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::{RwLock, mpsc};
use voxroom_protocol::PeerId;

/// Outbound queues for every live socket, keyed by the peer id assigned on connect.
///
/// Messages are serialized once here and written to the socket by the
/// connection's send task, so enqueueing never waits on the network.
pub struct ConnectionManager {
    senders: RwLock<HashMap<PeerId, mpsc::UnboundedSender<String>>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self {
            senders: RwLock::new(HashMap::new()),
        }
    }

    pub async fn add_connection(&self, peer_id: PeerId, sender: mpsc::UnboundedSender<String>) {
        self.senders.write().await.insert(peer_id, sender);
        tracing::debug!("Peer {} connected", peer_id);
    }

    pub async fn remove_connection(&self, peer_id: PeerId) {
        if self.senders.write().await.remove(&peer_id).is_some() {
            tracing::debug!("Peer {} connection removed", peer_id);
        }
    }

    /// Queue a message for one peer. Returns false if the peer is gone.
    pub async fn send_to_peer<M: Serialize>(&self, peer_id: PeerId, message: &M) -> bool {
        let json = match serde_json::to_string(message) {
            Ok(j) => j,
            Err(e) => {
                tracing::error!("Failed to serialize message: {}", e);
                return false;
            }
        };

        let senders = self.senders.read().await;

        match senders.get(&peer_id) {
            Some(sender) => {
                if let Err(e) = sender.send(json) {
                    tracing::error!("Failed to send message to {}: {}", peer_id, e);
                    return false;
                }
                true
            }
            None => {
                tracing::debug!("Dropping message for disconnected peer {}", peer_id);
                false
            }
        }
    }

    /// Queue the same message for several peers
    pub async fn send_to_peers<M: Serialize>(&self, peer_ids: &[PeerId], message: &M) {
        if peer_ids.is_empty() {
            return;
        }

        let json = match serde_json::to_string(message) {
            Ok(j) => j,
            Err(e) => {
                tracing::error!("Failed to serialize message: {}", e);
                return;
            }
        };

        let senders = self.senders.read().await;

        for peer_id in peer_ids {
            if let Some(sender) = senders.get(peer_id) {
                if let Err(e) = sender.send(json.clone()) {
                    tracing::error!("Failed to send message to {}: {}", peer_id, e);
                }
            }
        }
    }

    pub async fn is_connected(&self, peer_id: PeerId) -> bool {
        self.senders.read().await.contains_key(&peer_id)
    }

    pub async fn connection_count(&self) -> usize {
        self.senders.read().await.len()
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}
