use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use voxroom_protocol::{IceCandidate, PeerId, SessionDescription};

use super::session::SessionEvent;
use crate::error::LinkError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Connected,
    /// Transient loss; may still recover without renegotiation
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    LocalCandidate(IceCandidate),
    State(LinkState),
}

/// Callback sink handed to a link when it is created
///
/// Events are tagged with the link's generation so the session can discard
/// those from a link it has already replaced.
#[derive(Clone)]
pub struct LinkEvents {
    peer: PeerId,
    generation: u64,
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl LinkEvents {
    pub(crate) fn new(peer: PeerId, generation: u64, tx: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self {
            peer,
            generation,
            tx,
        }
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn emit(&self, event: LinkEvent) {
        let _ = self.tx.send(SessionEvent::Link {
            peer: self.peer,
            generation: self.generation,
            event,
        });
    }
}

/// One bidirectional audio link to a remote peer
#[async_trait]
pub trait MediaLink: Send + Sync {
    /// Create an offer and install it as the local description
    async fn create_offer(&self) -> Result<SessionDescription, LinkError>;

    /// Create an answer to the applied remote offer and install it locally
    async fn create_answer(&self) -> Result<SessionDescription, LinkError>;

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), LinkError>;

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), LinkError>;

    async fn close(&self);
}

#[async_trait]
pub trait LinkFactory: Send + Sync {
    async fn create(&self, remote: PeerId, events: LinkEvents) -> Result<Arc<dyn MediaLink>, LinkError>;
}
