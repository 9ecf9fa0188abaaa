use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    /// Direct peer-to-peer links to every co-member
    Mesh,
    /// One send and one receive transport through the server's router
    Sfu,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    pub server_url: String,
    pub room: String,
    pub mode: SessionMode,
    pub reconnect_delay_ms: u64,
    pub max_reconnect_attempts: u32,
    pub rpc_timeout_ms: u64,
}

impl ClientConfig {
    /// Defaults overridden by `VOXROOM_CLIENT_*` variables
    pub fn load() -> anyhow::Result<Self> {
        let settings = config::Config::builder()
            .set_default("server_url", "http://127.0.0.1:8080")?
            .set_default("room", "lobby")?
            .set_default("mode", "mesh")?
            .set_default("reconnect_delay_ms", 2000)?
            .set_default("max_reconnect_attempts", 5)?
            .set_default("rpc_timeout_ms", 10000)?
            .add_source(config::Environment::with_prefix("VOXROOM_CLIENT").try_parsing(true))
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    pub fn ws_url(&self) -> String {
        format!("{}/ws", self.socket_base())
    }

    pub fn sfu_url(&self) -> String {
        format!("{}/sfu", self.socket_base())
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    // Convert http to ws
    fn socket_base(&self) -> String {
        self.server_url
            .trim_end_matches('/')
            .replace("http://", "ws://")
            .replace("https://", "wss://")
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8080".to_string(),
            room: "lobby".to_string(),
            mode: SessionMode::Mesh,
            reconnect_delay_ms: 2000,
            max_reconnect_attempts: 5,
            rpc_timeout_ms: 10000,
        }
    }
}
