//! Shared helpers for the server integration tests

#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use serde::{Serialize, de::DeserializeOwned};
use std::time::Duration;
use tokio::time::timeout;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};

pub type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);
pub const SILENCE: Duration = Duration::from_millis(200);

/// Test server wrapper
pub struct TestServer {
    addr: std::net::SocketAddr,
    pub state: voxroom_server::state::AppState,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl TestServer {
    pub async fn start() -> anyhow::Result<Self> {
        Self::start_with(voxroom_server::state::Config::default()).await
    }

    pub async fn start_with(config: voxroom_server::state::Config) -> anyhow::Result<Self> {
        let config = voxroom_server::state::Config {
            bind_address: "127.0.0.1:0".to_string(),
            ..config
        };

        Self::serve(voxroom_server::state::AppState::new(config)).await
    }

    /// Start with a custom media engine behind the SFU
    pub async fn start_with_engine(
        engine: std::sync::Arc<dyn voxroom_media::MediaEngine>,
    ) -> anyhow::Result<Self> {
        let state =
            voxroom_server::state::AppState::with_engine(voxroom_server::state::Config::default(), engine);
        Self::serve(state).await
    }

    async fn serve(state: voxroom_server::state::AppState) -> anyhow::Result<Self> {
        let router = voxroom_server::api::create_router(state.clone());

        // Bind to random port
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        // Create shutdown channel
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();

        // Spawn server
        tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    shutdown_rx.await.ok();
                })
                .await
                .ok();
        });

        Ok(Self {
            addr,
            state,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    pub fn http_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    pub fn sfu_url(&self) -> String {
        format!("ws://{}/sfu", self.addr)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// A JSON-speaking WebSocket client
pub struct JsonSocket {
    ws: WsStream,
}

impl JsonSocket {
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let (ws, _) = connect_async(url).await?;
        Ok(Self { ws })
    }

    pub async fn send<M: Serialize>(&mut self, message: &M) -> anyhow::Result<()> {
        self.send_raw(serde_json::to_string(message)?).await
    }

    pub async fn send_raw(&mut self, text: String) -> anyhow::Result<()> {
        self.ws.send(Message::Text(text.into())).await?;
        Ok(())
    }

    pub async fn recv<M: DeserializeOwned>(&mut self) -> anyhow::Result<M> {
        loop {
            let frame = timeout(RECV_TIMEOUT, self.ws.next())
                .await?
                .ok_or_else(|| anyhow::anyhow!("Socket closed"))??;
            if let Message::Text(text) = frame {
                return Ok(serde_json::from_str(&text)?);
            }
        }
    }

    /// Assert nothing arrives for a short while
    pub async fn expect_silence(&mut self) {
        if let Ok(Some(Ok(Message::Text(text)))) = timeout(SILENCE, self.ws.next()).await {
            panic!("unexpected frame: {}", text);
        }
    }

    pub async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }
}
