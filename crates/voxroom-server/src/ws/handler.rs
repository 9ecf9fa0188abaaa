use crate::state::AppState;
use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use voxroom_protocol::{ClientMessage, PeerId, ServerMessage};

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();

    let peer_id = PeerId::new();

    // Create channel for outbound messages
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    state.connections.add_connection(peer_id, tx).await;

    // First frame tells the client who it is
    state
        .connections
        .send_to_peer(peer_id, &ServerMessage::Welcome { peer_id })
        .await;

    tracing::info!("Peer {} connected to signaling", peer_id);

    // Spawn task to forward messages from channel to WebSocket
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sender.send(Message::Text(msg.into())).await.is_err() {
                break;
            }
        }
    });

    // Messages from one peer are handled strictly in arrival order
    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                let client_msg: ClientMessage = match serde_json::from_str(&text) {
                    Ok(m) => m,
                    Err(e) => {
                        tracing::warn!("Invalid message from {}: {}", peer_id, e);
                        state
                            .connections
                            .send_to_peer(
                                peer_id,
                                &ServerMessage::Error {
                                    message: "Invalid message format".to_string(),
                                },
                            )
                            .await;
                        continue;
                    }
                };

                state.relay.handle_message(peer_id, client_msg).await;
            }
            Ok(Message::Close(_)) => break,
            Err(e) => {
                tracing::error!("WebSocket error for peer {}: {}", peer_id, e);
                break;
            }
            _ => {}
        }
    }

    // Cleanup on disconnect
    state.relay.disconnect(peer_id).await;
    state.connections.remove_connection(peer_id).await;

    // Abort the send task
    send_task.abort();

    tracing::info!("Peer {} disconnected from signaling", peer_id);
}
