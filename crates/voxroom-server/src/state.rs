use crate::rooms::RoomRegistry;
use crate::sfu::SfuOrchestrator;
use crate::ws::connections::ConnectionManager;
use crate::ws::relay::{MeshNotifier, SignalingRelay};
use serde::Deserialize;
use std::sync::Arc;
use voxroom_media::{LocalEngine, LocalEngineSettings, MediaEngine};

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    pub bind_address: String,
    pub stun_servers: Vec<String>,
    #[serde(default)]
    pub turn_servers: Vec<TurnServer>,
    /// 0 = unlimited
    pub max_peers_per_room: usize,
    /// Address written into SFU transport candidates
    pub announced_ip: String,
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
}

#[derive(Clone, Debug, Deserialize)]
pub struct TurnServer {
    pub url: String,
    pub username: String,
    pub credential: String,
}

impl Config {
    /// Defaults, then an optional `voxroom.toml`, then `VOXROOM_*` variables
    pub fn load() -> anyhow::Result<Self> {
        let settings = config::Config::builder()
            .set_default("bind_address", "0.0.0.0:8080")?
            .set_default("stun_servers", vec!["stun:stun.l.google.com:19302"])?
            .set_default("max_peers_per_room", 0)?
            .set_default("announced_ip", "127.0.0.1")?
            .set_default("rtc_min_port", 40000)?
            .set_default("rtc_max_port", 49999)?
            .add_source(config::File::with_name("voxroom").required(false))
            .add_source(
                config::Environment::with_prefix("VOXROOM")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("stun_servers"),
            )
            .build()?;

        let config: Config = settings.try_deserialize()?;

        if config.rtc_min_port > config.rtc_max_port {
            anyhow::bail!(
                "rtc_min_port ({}) is greater than rtc_max_port ({})",
                config.rtc_min_port,
                config.rtc_max_port
            );
        }

        if config.turn_servers.is_empty() {
            tracing::debug!("No TURN servers configured");
        }

        Ok(config)
    }

    pub fn engine_settings(&self) -> LocalEngineSettings {
        LocalEngineSettings {
            announced_ip: self.announced_ip.clone(),
            rtc_min_port: self.rtc_min_port,
            rtc_max_port: self.rtc_max_port,
            ..LocalEngineSettings::default()
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            turn_servers: vec![],
            max_peers_per_room: 0,
            announced_ip: "127.0.0.1".to_string(),
            rtc_min_port: 40000,
            rtc_max_port: 49999,
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub connections: Arc<ConnectionManager>,
    /// Mesh room membership
    pub rooms: Arc<RoomRegistry>,
    pub relay: Arc<SignalingRelay>,
    pub sfu: Arc<SfuOrchestrator>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let engine = Arc::new(LocalEngine::new(config.engine_settings()));
        Self::with_engine(config, engine)
    }

    pub fn with_engine(config: Config, engine: Arc<dyn MediaEngine>) -> Self {
        let connections = Arc::new(ConnectionManager::new());

        let rooms = Arc::new(RoomRegistry::new(
            Arc::new(MeshNotifier::new(connections.clone())),
            config.max_peers_per_room,
        ));
        let relay = Arc::new(SignalingRelay::new(rooms.clone(), connections.clone()));
        let sfu = Arc::new(SfuOrchestrator::new(
            engine,
            connections.clone(),
            config.max_peers_per_room,
        ));

        Self {
            config: Arc::new(config),
            connections,
            rooms,
            relay,
            sfu,
        }
    }

    /// Release every room and router. Called once the listener has stopped.
    pub async fn shutdown(&self) {
        self.rooms.clear().await;
        self.sfu.shutdown().await;
        tracing::info!("Room state cleared");
    }
}
