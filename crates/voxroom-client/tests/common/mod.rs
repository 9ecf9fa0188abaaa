//! In-process server for the client integration tests

#![allow(dead_code)]

use std::time::Duration;

pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

pub struct TestServer {
    addr: std::net::SocketAddr,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl TestServer {
    pub async fn start() -> anyhow::Result<Self> {
        let config = voxroom_server::state::Config {
            bind_address: "127.0.0.1:0".to_string(),
            ..voxroom_server::state::Config::default()
        };

        let (router, _state) = voxroom_server::create_app(config);

        // Bind to random port
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();

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
