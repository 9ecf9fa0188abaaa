use async_trait::async_trait;
use std::sync::Arc;
use voxroom_protocol::{IceCandidate, IceServer, PeerId, SdpType, SessionDescription};
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MediaEngine};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use super::link::{LinkEvent, LinkEvents, LinkFactory, LinkState, MediaLink};
use crate::error::LinkError;

impl From<webrtc::Error> for LinkError {
    fn from(e: webrtc::Error) -> Self {
        LinkError::WebRtc(e.to_string())
    }
}

/// Builds webrtc-rs peer connections carrying one Opus track each way
pub struct WebRtcLinkFactory {
    ice_servers: Vec<RTCIceServer>,
}

impl WebRtcLinkFactory {
    pub fn new(ice_servers: &[IceServer]) -> Self {
        let ice_servers = ice_servers
            .iter()
            .map(|server| RTCIceServer {
                urls: server.urls.clone(),
                username: server.username.clone().unwrap_or_default(),
                credential: server.credential.clone().unwrap_or_default(),
                ..Default::default()
            })
            .collect();

        Self { ice_servers }
    }
}

#[async_trait]
impl LinkFactory for WebRtcLinkFactory {
    async fn create(&self, remote: PeerId, events: LinkEvents) -> Result<Arc<dyn MediaLink>, LinkError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };

        let peer_connection = Arc::new(api.new_peer_connection(config).await?);

        let audio_track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
            "audio".to_owned(),
            format!("voxroom-{}", remote),
        ));
        peer_connection
            .add_track(audio_track as Arc<dyn TrackLocal + Send + Sync>)
            .await?;

        let candidate_events = events.clone();
        peer_connection.on_ice_candidate(Box::new(move |candidate| {
            let events = candidate_events.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(json) => events.emit(LinkEvent::LocalCandidate(IceCandidate {
                        candidate: json.candidate,
                        sdp_mid: json.sdp_mid,
                        sdp_mline_index: json.sdp_mline_index,
                        username_fragment: json.username_fragment,
                    })),
                    Err(e) => tracing::warn!("Failed to encode local candidate: {}", e),
                }
            })
        }));

        let state_events = events;
        peer_connection.on_peer_connection_state_change(Box::new(move |state| {
            let events = state_events.clone();
            Box::pin(async move {
                if let Some(state) = link_state(state) {
                    events.emit(LinkEvent::State(state));
                }
            })
        }));

        peer_connection.on_track(Box::new(move |track, _receiver, _transceiver| {
            tracing::info!("Receiving {:?} track from {}", track.kind(), remote);
            Box::pin(async {})
        }));

        Ok(Arc::new(WebRtcLink { peer_connection }))
    }
}

fn link_state(state: RTCPeerConnectionState) -> Option<LinkState> {
    match state {
        RTCPeerConnectionState::Connecting => Some(LinkState::Connecting),
        RTCPeerConnectionState::Connected => Some(LinkState::Connected),
        RTCPeerConnectionState::Disconnected => Some(LinkState::Disconnected),
        RTCPeerConnectionState::Failed => Some(LinkState::Failed),
        RTCPeerConnectionState::Closed => Some(LinkState::Closed),
        _ => None,
    }
}

pub struct WebRtcLink {
    peer_connection: Arc<RTCPeerConnection>,
}

#[async_trait]
impl MediaLink for WebRtcLink {
    async fn create_offer(&self) -> Result<SessionDescription, LinkError> {
        let offer = self.peer_connection.create_offer(None).await?;
        self.peer_connection.set_local_description(offer.clone()).await?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, LinkError> {
        let answer = self.peer_connection.create_answer(None).await?;
        self.peer_connection.set_local_description(answer.clone()).await?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), LinkError> {
        let description = match description.sdp_type {
            SdpType::Offer => RTCSessionDescription::offer(description.sdp)?,
            SdpType::Answer => RTCSessionDescription::answer(description.sdp)?,
        };
        self.peer_connection.set_remote_description(description).await?;
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), LinkError> {
        let candidate = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.peer_connection.add_ice_candidate(candidate).await?;
        Ok(())
    }

    async fn close(&self) {
        if let Err(e) = self.peer_connection.close().await {
            tracing::debug!("Error closing peer connection: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn transient_states_are_not_reported() {
        assert_eq!(link_state(RTCPeerConnectionState::New), None);
        assert_eq!(
            link_state(RTCPeerConnectionState::Failed),
            Some(LinkState::Failed)
        );
    }

    #[test]
    fn ice_servers_keep_turn_credentials() {
        let factory = WebRtcLinkFactory::new(&[IceServer {
            urls: vec!["turn:turn.example.org:3478".to_string()],
            username: Some("alice".to_string()),
            credential: Some("secret".to_string()),
        }]);
        assert_eq!(factory.ice_servers[0].username, "alice");
        assert_eq!(factory.ice_servers[0].credential, "secret");
    }

    #[tokio::test]
    async fn offer_carries_an_audio_section() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let factory = WebRtcLinkFactory::new(&[]);
        let link = factory
            .create(PeerId::new(), LinkEvents::new(PeerId::new(), 1, tx))
            .await
            .unwrap();

        let offer = link.create_offer().await.unwrap();
        assert_eq!(offer.sdp_type, SdpType::Offer);
        assert!(offer.sdp.contains("m=audio"));

        link.close().await;
    }
}
