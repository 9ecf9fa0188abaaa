//! Integration tests for mesh signaling on `/ws`
//!
//! Run with: cargo test -p voxroom-server --test integration_tests

mod common;

use common::{JsonSocket, TestServer};
use reqwest::Client;
use tokio_test::assert_ok;
use voxroom_protocol::{
    ClientMessage, IceCandidate, PeerId, RoomId, ServerMessage, SessionDescription,
};

struct Peer {
    id: PeerId,
    socket: JsonSocket,
}

impl Peer {
    async fn connect(server: &TestServer) -> anyhow::Result<Self> {
        let mut socket = JsonSocket::connect(&server.ws_url()).await?;
        match socket.recv::<ServerMessage>().await? {
            ServerMessage::Welcome { peer_id } => Ok(Self {
                id: peer_id,
                socket,
            }),
            other => Err(anyhow::anyhow!("Expected welcome, got {:?}", other)),
        }
    }

    async fn join(&mut self, room: &str) -> anyhow::Result<Vec<PeerId>> {
        self.socket
            .send(&ClientMessage::JoinRoom {
                room_id: room.to_string(),
            })
            .await?;
        match self.socket.recv::<ServerMessage>().await? {
            ServerMessage::ExistingUsers { users } => Ok(users),
            other => Err(anyhow::anyhow!("Expected existing-users, got {:?}", other)),
        }
    }

    async fn recv(&mut self) -> ServerMessage {
        self.socket.recv().await.expect("no message")
    }
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_health_check() {
    let server = TestServer::start().await.unwrap();
    let response = assert_ok!(
        Client::new()
            .get(format!("{}/health", server.http_url()))
            .send()
            .await
    );
    assert!(response.status().is_success());
    assert_eq!(response.text().await.unwrap(), "OK");
}

#[tokio::test]
async fn test_three_peers_join_and_one_disconnects() {
    let server = TestServer::start().await.unwrap();
    let mut a = Peer::connect(&server).await.unwrap();
    let mut b = Peer::connect(&server).await.unwrap();
    let mut c = Peer::connect(&server).await.unwrap();

    assert_eq!(a.join("r1").await.unwrap(), vec![]);

    assert_eq!(b.join("r1").await.unwrap(), vec![a.id]);
    assert_eq!(a.recv().await, ServerMessage::UserConnected { peer_id: b.id });

    assert_eq!(c.join("r1").await.unwrap(), vec![a.id, b.id]);
    assert_eq!(a.recv().await, ServerMessage::UserConnected { peer_id: c.id });
    assert_eq!(b.recv().await, ServerMessage::UserConnected { peer_id: c.id });

    let b_id = b.id;
    b.socket.close().await;

    assert_eq!(a.recv().await, ServerMessage::UserDisconnected { peer_id: b_id });
    assert_eq!(c.recv().await, ServerMessage::UserDisconnected { peer_id: b_id });
    a.socket.expect_silence().await;
    c.socket.expect_silence().await;

    let room = RoomId::sanitize("r1").unwrap();
    let mut members = server.state.rooms.members_of(&room).await;
    members.sort();
    let mut expected = vec![a.id, c.id];
    expected.sort();
    assert_eq!(members, expected);
}

#[tokio::test]
async fn test_abrupt_disconnect_notifies_once() {
    let server = TestServer::start().await.unwrap();
    let mut a = Peer::connect(&server).await.unwrap();
    let mut b = Peer::connect(&server).await.unwrap();

    a.join("abrupt").await.unwrap();
    b.join("abrupt").await.unwrap();
    a.recv().await;

    let b_id = b.id;
    // No close frame: the TCP stream just goes away
    drop(b);

    assert_eq!(a.recv().await, ServerMessage::UserDisconnected { peer_id: b_id });
    a.socket.expect_silence().await;
}

#[tokio::test]
async fn test_offer_answer_and_candidates_are_relayed() {
    let server = TestServer::start().await.unwrap();
    let mut a = Peer::connect(&server).await.unwrap();
    let mut b = Peer::connect(&server).await.unwrap();

    a.join("call").await.unwrap();
    b.join("call").await.unwrap();
    a.recv().await;

    // Newcomer offers to the existing member
    b.socket
        .send(&ClientMessage::Offer {
            target: a.id,
            description: SessionDescription::offer("v=0 offer"),
        })
        .await
        .unwrap();
    assert_eq!(
        a.recv().await,
        ServerMessage::Offer {
            offerer: b.id,
            description: SessionDescription::offer("v=0 offer"),
        }
    );

    a.socket
        .send(&ClientMessage::Answer {
            target: b.id,
            description: SessionDescription::answer("v=0 answer"),
        })
        .await
        .unwrap();
    assert_eq!(
        b.recv().await,
        ServerMessage::Answer {
            answerer: a.id,
            description: SessionDescription::answer("v=0 answer"),
        }
    );

    let candidate = IceCandidate {
        candidate: "candidate:1 1 udp 2122260223 10.0.0.1 54321 typ host".to_string(),
        sdp_mid: Some("0".to_string()),
        sdp_mline_index: Some(0),
        username_fragment: None,
    };
    a.socket
        .send(&ClientMessage::IceCandidate {
            target: b.id,
            candidate: candidate.clone(),
        })
        .await
        .unwrap();
    assert_eq!(
        b.recv().await,
        ServerMessage::IceCandidate {
            sender: a.id,
            candidate,
        }
    );
}

#[tokio::test]
async fn test_offer_to_another_room_is_dropped() {
    let server = TestServer::start().await.unwrap();
    let mut a = Peer::connect(&server).await.unwrap();
    let mut b = Peer::connect(&server).await.unwrap();

    a.join("left").await.unwrap();
    b.join("right").await.unwrap();

    a.socket
        .send(&ClientMessage::Offer {
            target: b.id,
            description: SessionDescription::offer("v=0"),
        })
        .await
        .unwrap();

    b.socket.expect_silence().await;
    // The sender is not told either
    a.socket.expect_silence().await;
}

#[tokio::test]
async fn test_switching_rooms_leaves_the_old_one() {
    let server = TestServer::start().await.unwrap();
    let mut a = Peer::connect(&server).await.unwrap();
    let mut b = Peer::connect(&server).await.unwrap();

    a.join("first").await.unwrap();
    b.join("first").await.unwrap();
    a.recv().await;

    assert_eq!(b.join("second").await.unwrap(), vec![]);
    assert_eq!(a.recv().await, ServerMessage::UserDisconnected { peer_id: b.id });
}

#[tokio::test]
async fn test_invalid_room_name_is_rejected() {
    let server = TestServer::start().await.unwrap();
    let mut a = Peer::connect(&server).await.unwrap();

    a.socket
        .send(&ClientMessage::JoinRoom {
            room_id: "%%%".to_string(),
        })
        .await
        .unwrap();

    assert!(matches!(a.recv().await, ServerMessage::Error { .. }));
    assert_eq!(server.state.rooms.room_count().await, 0);
}

#[tokio::test]
async fn test_room_names_are_sanitized() {
    let server = TestServer::start().await.unwrap();
    let mut a = Peer::connect(&server).await.unwrap();
    let mut b = Peer::connect(&server).await.unwrap();

    a.join("team room!").await.unwrap();
    assert_eq!(b.join("teamroom").await.unwrap(), vec![a.id]);

    let rooms: serde_json::Value = Client::new()
        .get(format!("{}/api/rooms", server.http_url()))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(rooms[0]["room_id"], "teamroom");
    assert_eq!(rooms[0]["members"], 2);
}

#[tokio::test]
async fn test_full_room_rejects_newcomer() {
    let config = voxroom_server::state::Config {
        max_peers_per_room: 1,
        ..Default::default()
    };
    let server = TestServer::start_with(config).await.unwrap();
    let mut a = Peer::connect(&server).await.unwrap();
    let mut b = Peer::connect(&server).await.unwrap();

    a.join("solo").await.unwrap();
    b.socket
        .send(&ClientMessage::JoinRoom {
            room_id: "solo".to_string(),
        })
        .await
        .unwrap();

    assert!(matches!(b.recv().await, ServerMessage::Error { .. }));
    a.socket.expect_silence().await;
}
