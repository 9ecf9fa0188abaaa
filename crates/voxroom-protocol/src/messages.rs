use serde::{Deserialize, Serialize};

use crate::types::{IceCandidate, PeerId, SessionDescription};

/// Mesh signaling messages sent from client to server via WebSocket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Join (or switch to) a room; the raw name is sanitized server-side
    JoinRoom { room_id: String },

    /// Leave the current room without disconnecting
    LeaveRoom,

    /// WebRTC offer for a co-member
    Offer {
        target: PeerId,
        description: SessionDescription,
    },

    /// WebRTC answer for a co-member
    Answer {
        target: PeerId,
        description: SessionDescription,
    },

    /// Trickled ICE candidate for a co-member
    IceCandidate {
        target: PeerId,
        candidate: IceCandidate,
    },
}

/// Mesh signaling messages sent from server to client via WebSocket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// First frame on every connection
    Welcome { peer_id: PeerId },

    /// Snapshot of the room the peer just joined, excluding the peer itself
    ExistingUsers { users: Vec<PeerId> },

    /// Another peer joined the room
    UserConnected { peer_id: PeerId },

    /// Another peer left the room or disconnected
    UserDisconnected { peer_id: PeerId },

    Offer {
        offerer: PeerId,
        description: SessionDescription,
    },

    Answer {
        answerer: PeerId,
        description: SessionDescription,
    },

    IceCandidate {
        sender: PeerId,
        candidate: IceCandidate,
    },

    /// Request rejected before it reached any other peer
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn join_room_wire_format() {
        let msg: ClientMessage =
            serde_json::from_value(json!({ "type": "join-room", "roomId": "r1" })).unwrap();
        assert_eq!(
            msg,
            ClientMessage::JoinRoom {
                room_id: "r1".to_string()
            }
        );
    }

    #[test]
    fn offer_is_relayed_with_offerer_field() {
        let peer = PeerId::new();
        let msg = ServerMessage::Offer {
            offerer: peer,
            description: SessionDescription::offer("v=0"),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "offer");
        assert_eq!(value["offerer"], peer.to_string());
        assert_eq!(value["description"]["type"], "offer");
        assert_eq!(value["description"]["sdp"], "v=0");
    }

    #[test]
    fn membership_notifications_use_kebab_case_tags() {
        let peer = PeerId::new();
        let value = serde_json::to_value(ServerMessage::UserDisconnected { peer_id: peer }).unwrap();
        assert_eq!(value["type"], "user-disconnected");
        assert_eq!(value["peerId"], peer.to_string());

        let value = serde_json::to_value(ServerMessage::ExistingUsers { users: vec![] }).unwrap();
        assert_eq!(value, json!({ "type": "existing-users", "users": [] }));
    }
}
