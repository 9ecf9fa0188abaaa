use futures_util::{SinkExt, StreamExt};
use serde::{Serialize, de::DeserializeOwned};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use crate::error::ClientError;

/// Typed halves of a signaling socket
///
/// Frames queued on `outbound` are serialized and written by a background
/// task. Decoded frames arrive on `inbound`; the channel closing means the
/// socket is gone.
pub struct Connection<Out, In> {
    pub outbound: mpsc::UnboundedSender<Out>,
    pub inbound: mpsc::UnboundedReceiver<In>,
}

pub async fn connect<Out, In>(url: &str) -> Result<Connection<Out, In>, ClientError>
where
    Out: Serialize + Send + 'static,
    In: DeserializeOwned + Send + 'static,
{
    let (ws_stream, _) = connect_async(url).await?;
    let (mut write, mut read) = ws_stream.split();

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Out>();
    let (in_tx, in_rx) = mpsc::unbounded_channel::<In>();

    // Spawn task to handle outgoing messages
    tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            let json = match serde_json::to_string(&msg) {
                Ok(j) => j,
                Err(e) => {
                    tracing::error!("Failed to serialize message: {}", e);
                    continue;
                }
            };

            if write.send(Message::Text(json.into())).await.is_err() {
                tracing::error!("Failed to send WebSocket message");
                break;
            }
        }

        let _ = write.close().await;
    });

    // Spawn task to handle incoming messages
    tokio::spawn(async move {
        while let Some(result) = read.next().await {
            match result {
                Ok(Message::Text(text)) => match serde_json::from_str::<In>(&text) {
                    Ok(msg) => {
                        if in_tx.send(msg).is_err() {
                            break;
                        }
                    }
                    Err(e) => tracing::warn!("Ignoring undecodable frame: {}", e),
                },
                Ok(Message::Close(_)) => {
                    tracing::info!("WebSocket closed by server");
                    break;
                }
                Err(e) => {
                    tracing::error!("WebSocket error: {}", e);
                    break;
                }
                _ => {}
            }
        }
    });

    Ok(Connection {
        outbound: out_tx,
        inbound: in_rx,
    })
}
