use crate::sfu::Responder;
use crate::state::AppState;
use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use voxroom_protocol::{PeerId, RpcErrorCode, RpcRequest, SfuClientMessage, SfuServerMessage};

/// Work queued for a connection's request processor
enum Inbound {
    Request(RpcRequest),
    /// Undecodable request that still carried an id we can answer
    Malformed { id: u64, reason: String },
}

pub async fn sfu_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();

    let peer_id = PeerId::new();

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    state.connections.add_connection(peer_id, tx.clone()).await;
    state.sfu.register_peer(peer_id).await;

    state
        .connections
        .send_to_peer(peer_id, &SfuServerMessage::Welcome { peer_id })
        .await;

    tracing::info!("Peer {} connected to SFU", peer_id);

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sender.send(Message::Text(msg.into())).await.is_err() {
                break;
            }
        }
    });

    // Requests run one at a time so acks leave in submission order
    let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel::<Inbound>();
    let closing = Arc::new(AtomicBool::new(false));
    let sfu = state.sfu.clone();
    let processor_closing = closing.clone();
    let processor = tokio::spawn(async move {
        while let Some(inbound) = inbound_rx.recv().await {
            match inbound {
                Inbound::Request(request) => {
                    let responder = Responder::new(request.id, tx.clone());
                    if processor_closing.load(Ordering::SeqCst) {
                        // Dropping the responder answers with a cancellation
                        tracing::debug!("Cancelling queued request #{} of {}", request.id, peer_id);
                        continue;
                    }
                    tracing::debug!(
                        "Peer {} request #{} {}",
                        peer_id,
                        request.id,
                        request.request.name()
                    );
                    let result = sfu.dispatch(peer_id, request.request).await;
                    responder.ack(result);
                }
                Inbound::Malformed { id, reason } => {
                    Responder::new(id, tx.clone()).reject(RpcErrorCode::InvalidRequest, reason);
                }
            }
        }
    });

    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => match parse_inbound(&text) {
                Some(inbound) => {
                    if inbound_tx.send(inbound).is_err() {
                        break;
                    }
                }
                None => tracing::warn!("Ignoring undecodable frame from {}", peer_id),
            },
            Ok(Message::Close(_)) => break,
            Err(e) => {
                tracing::error!("WebSocket error for SFU peer {}: {}", peer_id, e);
                break;
            }
            _ => {}
        }
    }

    // Let the request in flight record what it created, then tear it all down
    closing.store(true, Ordering::SeqCst);
    drop(inbound_tx);
    if let Err(e) = processor.await {
        tracing::error!("SFU request processor for {} failed: {}", peer_id, e);
    }

    state.sfu.disconnect(peer_id).await;
    state.connections.remove_connection(peer_id).await;

    send_task.abort();

    tracing::info!("Peer {} disconnected from SFU", peer_id);
}

fn parse_inbound(text: &str) -> Option<Inbound> {
    match serde_json::from_str::<SfuClientMessage>(text) {
        Ok(SfuClientMessage::Request(request)) => Some(Inbound::Request(request)),
        Err(e) => {
            let id = serde_json::from_str::<serde_json::Value>(text)
                .ok()
                .and_then(|value| value.get("id").and_then(|id| id.as_u64()))?;
            Some(Inbound::Malformed {
                id,
                reason: format!("Malformed request: {}", e),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_request_with_id_is_answerable() {
        let inbound = parse_inbound(r#"{"type":"request","id":5,"request":{"type":"fly"}}"#);
        assert!(matches!(inbound, Some(Inbound::Malformed { id: 5, .. })));
    }

    #[test]
    fn garbage_without_id_is_ignored() {
        assert!(parse_inbound("not json").is_none());
    }

    #[test]
    fn well_formed_request_is_queued() {
        let inbound =
            parse_inbound(r#"{"type":"request","id":1,"request":{"type":"getProducers"}}"#);
        assert!(matches!(inbound, Some(Inbound::Request(RpcRequest { id: 1, .. }))));
    }
}
