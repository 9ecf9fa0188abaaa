use anyhow::Result;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use voxroom_client::mesh::{self, WebRtcLinkFactory};
use voxroom_client::negotiation::ReconnectPolicy;
use voxroom_client::network::api;
use voxroom_client::sfu::SfuSession;
use voxroom_client::{ClientConfig, SessionMode};
use voxroom_protocol::TransportDirection;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voxroom_client=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ClientConfig::load()?;
    tracing::info!(
        "Starting Voxroom client ({:?}) for room {} on {}",
        config.mode,
        config.room,
        config.server_url
    );

    match config.mode {
        SessionMode::Mesh => run_mesh(&config).await,
        SessionMode::Sfu => run_sfu(&config).await,
    }
}

async fn run_mesh(config: &ClientConfig) -> Result<()> {
    let ice_servers = match api::fetch_ice_servers(&config.server_url).await {
        Ok(servers) => servers,
        Err(e) => {
            tracing::warn!("Could not fetch ICE servers, continuing without: {}", e);
            Vec::new()
        }
    };

    let factory = Arc::new(WebRtcLinkFactory::new(&ice_servers));
    let policy = ReconnectPolicy::new(config.reconnect_delay(), config.max_reconnect_attempts);

    let (session, events) = mesh::connect(&config.ws_url(), factory, policy).await?;
    session.join(&config.room);

    session.run(events, shutdown_signal()).await;
    tracing::info!("Client stopped");
    Ok(())
}

async fn run_sfu(config: &ClientConfig) -> Result<()> {
    let mut session = SfuSession::connect(&config.sfu_url(), config.rpc_timeout()).await?;

    session.join(&config.room).await?;

    session.create_transport(TransportDirection::Send).await?;
    session.connect_transport(TransportDirection::Send).await?;
    session.create_transport(TransportDirection::Recv).await?;
    session.connect_transport(TransportDirection::Recv).await?;

    let producer_id = session.produce_audio().await?;
    tracing::info!("Publishing audio as {}", producer_id);

    let consumed = session.consume_existing().await?;
    tracing::info!("Receiving {} existing producer(s)", consumed);

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                if let Err(e) = session.leave().await {
                    tracing::warn!("Failed to leave room cleanly: {}", e);
                }
                break;
            }
            notification = session.next_notification() => match notification {
                Some(notification) => {
                    if let Err(e) = session.handle_notification(notification).await {
                        tracing::warn!("Failed to handle notification: {}", e);
                    }
                }
                None => {
                    tracing::warn!("SFU connection lost");
                    break;
                }
            }
        }
    }

    tracing::info!("Client stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
