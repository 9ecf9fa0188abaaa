//! Mesh signaling relay
//!
//! Forwards offers, answers and ICE candidates between co-members of a room
//! and announces membership changes. The server never inspects SDP.

use async_trait::async_trait;
use std::sync::Arc;
use voxroom_protocol::{ClientMessage, PeerId, RoomId, ServerMessage};

use crate::rooms::{MembershipObserver, RoomRegistry};
use crate::ws::connections::ConnectionManager;

/// Turns registry membership changes into signaling notifications
pub struct MeshNotifier {
    connections: Arc<ConnectionManager>,
}

impl MeshNotifier {
    pub fn new(connections: Arc<ConnectionManager>) -> Self {
        Self { connections }
    }
}

#[async_trait]
impl MembershipObserver for MeshNotifier {
    async fn peer_joined(&self, _room_id: &RoomId, peer_id: PeerId, existing: &[PeerId]) {
        // The joiner's snapshot goes out before anyone hears about the join
        self.connections
            .send_to_peer(
                peer_id,
                &ServerMessage::ExistingUsers {
                    users: existing.to_vec(),
                },
            )
            .await;

        self.connections
            .send_to_peers(existing, &ServerMessage::UserConnected { peer_id })
            .await;
    }

    async fn peer_left(&self, _room_id: &RoomId, peer_id: PeerId, remaining: &[PeerId]) {
        self.connections
            .send_to_peers(remaining, &ServerMessage::UserDisconnected { peer_id })
            .await;
    }
}

pub struct SignalingRelay {
    rooms: Arc<RoomRegistry>,
    connections: Arc<ConnectionManager>,
}

impl SignalingRelay {
    pub fn new(rooms: Arc<RoomRegistry>, connections: Arc<ConnectionManager>) -> Self {
        Self { rooms, connections }
    }

    pub async fn handle_message(&self, peer_id: PeerId, message: ClientMessage) {
        match message {
            ClientMessage::JoinRoom { room_id } => self.join(peer_id, &room_id).await,
            ClientMessage::LeaveRoom => {
                if self.rooms.leave(peer_id).await.is_none() {
                    tracing::debug!("Peer {} sent leave-room outside a room", peer_id);
                }
            }
            ClientMessage::Offer {
                target,
                description,
            } => {
                if self.can_relay(peer_id, target, "offer").await {
                    self.connections
                        .send_to_peer(
                            target,
                            &ServerMessage::Offer {
                                offerer: peer_id,
                                description,
                            },
                        )
                        .await;
                }
            }
            ClientMessage::Answer {
                target,
                description,
            } => {
                if self.can_relay(peer_id, target, "answer").await {
                    self.connections
                        .send_to_peer(
                            target,
                            &ServerMessage::Answer {
                                answerer: peer_id,
                                description,
                            },
                        )
                        .await;
                }
            }
            ClientMessage::IceCandidate { target, candidate } => {
                if self.can_relay(peer_id, target, "ice-candidate").await {
                    self.connections
                        .send_to_peer(
                            target,
                            &ServerMessage::IceCandidate {
                                sender: peer_id,
                                candidate,
                            },
                        )
                        .await;
                }
            }
        }
    }

    /// Implicit leave for a closed socket
    pub async fn disconnect(&self, peer_id: PeerId) {
        if let Some(outcome) = self.rooms.leave(peer_id).await {
            tracing::info!(
                "Peer {} dropped out of room {} ({} remaining)",
                peer_id,
                outcome.room_id,
                outcome.remaining.len()
            );
        }
    }

    async fn join(&self, peer_id: PeerId, room_name: &str) {
        match self.rooms.join(peer_id, room_name).await {
            Ok(outcome) if outcome.rejoined => {
                // Nothing changed; refresh the peer's view only
                self.connections
                    .send_to_peer(
                        peer_id,
                        &ServerMessage::ExistingUsers {
                            users: outcome.existing,
                        },
                    )
                    .await;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!("Peer {} could not join {:?}: {}", peer_id, room_name, e);
                self.connections
                    .send_to_peer(
                        peer_id,
                        &ServerMessage::Error {
                            message: e.to_string(),
                        },
                    )
                    .await;
            }
        }
    }

    async fn can_relay(&self, sender: PeerId, target: PeerId, kind: &str) -> bool {
        if sender == target {
            tracing::warn!("Dropping {} from {} addressed to itself", kind, sender);
            return false;
        }

        if !self.rooms.are_co_members(sender, target).await {
            tracing::warn!(
                "Dropping {} from {} to {}: not in the same room",
                kind,
                sender,
                target
            );
            return false;
        }

        true
    }
}
