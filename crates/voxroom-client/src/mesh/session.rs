//! Mesh session actor
//!
//! Owns one [`PeerConnectionState`] and one media link per co-member and
//! drives them from signaling frames, link callbacks and retry timers, all
//! funnelled through a single event channel so no state is shared.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use voxroom_protocol::{ClientMessage, IceCandidate, PeerId, ServerMessage, SessionDescription};

use super::link::{LinkEvent, LinkEvents, LinkFactory, LinkState, MediaLink};
use crate::error::{ClientError, LinkError};
use crate::negotiation::{
    AnswerDecision, CandidateAction, OfferDecision, PeerConnectionState, ReconnectPolicy, SignalingPhase,
};
use crate::network;

const WELCOME_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug)]
pub enum SessionEvent {
    Server(ServerMessage),
    ServerClosed,
    Link {
        peer: PeerId,
        generation: u64,
        event: LinkEvent,
    },
    Retry {
        peer: PeerId,
    },
}

struct PeerLink {
    state: PeerConnectionState,
    link: Arc<dyn MediaLink>,
    generation: u64,
}

pub struct MeshSession {
    local: PeerId,
    links: HashMap<PeerId, PeerLink>,
    members: HashSet<PeerId>,
    attempts: HashMap<PeerId, u32>,
    outbound: mpsc::UnboundedSender<ClientMessage>,
    factory: Arc<dyn LinkFactory>,
    policy: ReconnectPolicy,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    next_generation: u64,
}

/// Open the signaling socket and wait for the server to assign our id
pub async fn connect(
    url: &str,
    factory: Arc<dyn LinkFactory>,
    policy: ReconnectPolicy,
) -> Result<(MeshSession, mpsc::UnboundedReceiver<SessionEvent>), ClientError> {
    let network::Connection {
        outbound,
        mut inbound,
    } = network::connect::<ClientMessage, ServerMessage>(url).await?;

    let local = match tokio::time::timeout(WELCOME_TIMEOUT, inbound.recv()).await {
        Ok(Some(ServerMessage::Welcome { peer_id })) => peer_id,
        Ok(Some(other)) => {
            return Err(ClientError::Protocol(format!("Expected welcome, got {:?}", other)));
        }
        Ok(None) => return Err(ClientError::Closed),
        Err(_) => return Err(ClientError::Protocol("Timed out waiting for welcome".to_string())),
    };

    tracing::info!("Connected to signaling server as {}", local);

    let (session, events) = MeshSession::new(local, outbound, factory, policy);

    let tx = session.events();
    tokio::spawn(async move {
        while let Some(msg) = inbound.recv().await {
            if tx.send(SessionEvent::Server(msg)).is_err() {
                return;
            }
        }
        let _ = tx.send(SessionEvent::ServerClosed);
    });

    Ok((session, events))
}

impl MeshSession {
    pub fn new(
        local: PeerId,
        outbound: mpsc::UnboundedSender<ClientMessage>,
        factory: Arc<dyn LinkFactory>,
        policy: ReconnectPolicy,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let session = Self {
            local,
            links: HashMap::new(),
            members: HashSet::new(),
            attempts: HashMap::new(),
            outbound,
            factory,
            policy,
            events_tx,
            next_generation: 0,
        };
        (session, events_rx)
    }

    pub fn local_peer(&self) -> PeerId {
        self.local
    }

    pub fn events(&self) -> mpsc::UnboundedSender<SessionEvent> {
        self.events_tx.clone()
    }

    pub fn members(&self) -> Vec<PeerId> {
        let mut members: Vec<PeerId> = self.members.iter().copied().collect();
        members.sort();
        members
    }

    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    pub fn link_phase(&self, peer: PeerId) -> Option<SignalingPhase> {
        self.links.get(&peer).map(|entry| entry.state.phase())
    }

    pub fn join(&self, room: &str) {
        self.send(ClientMessage::JoinRoom {
            room_id: room.to_string(),
        });
    }

    pub async fn leave(&mut self) {
        self.send(ClientMessage::LeaveRoom);
        self.members.clear();
        self.close_all().await;
    }

    /// Process events until the signaling socket closes or `shutdown` resolves
    pub async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<SessionEvent>,
        shutdown: impl Future<Output = ()>,
    ) {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("Mesh session shutting down");
                    break;
                }
                event = events.recv() => match event {
                    Some(SessionEvent::ServerClosed) | None => {
                        tracing::warn!("Signaling connection lost");
                        break;
                    }
                    Some(event) => self.handle(event).await,
                }
            }
        }

        self.close_all().await;
    }

    pub async fn handle(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Server(message) => self.handle_server(message).await,
            SessionEvent::ServerClosed => self.close_all().await,
            SessionEvent::Link {
                peer,
                generation,
                event,
            } => self.handle_link(peer, generation, event).await,
            SessionEvent::Retry { peer } => self.retry(peer).await,
        }
    }

    async fn handle_server(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::Welcome { peer_id } => {
                tracing::debug!("Duplicate welcome for {}", peer_id);
            }
            ServerMessage::ExistingUsers { users } => {
                // A fresh snapshot replaces whatever room we were in
                let stale: Vec<PeerId> = self
                    .links
                    .keys()
                    .filter(|peer| !users.contains(peer))
                    .copied()
                    .collect();
                for peer in stale {
                    self.drop_peer(peer).await;
                }

                self.members = users.iter().copied().collect();
                tracing::info!("Joined room with {} other peer(s)", users.len());

                for peer in users {
                    if !self.links.contains_key(&peer) {
                        self.offer_to(peer).await;
                    }
                }
            }
            ServerMessage::UserConnected { peer_id } => {
                tracing::info!("Peer {} joined; waiting for its offer", peer_id);
                self.members.insert(peer_id);
            }
            ServerMessage::UserDisconnected { peer_id } => {
                tracing::info!("Peer {} left", peer_id);
                self.members.remove(&peer_id);
                self.drop_peer(peer_id).await;
            }
            ServerMessage::Offer {
                offerer,
                description,
            } => self.on_offer(offerer, description).await,
            ServerMessage::Answer {
                answerer,
                description,
            } => self.on_answer(answerer, description).await,
            ServerMessage::IceCandidate { sender, candidate } => {
                self.on_candidate(sender, candidate).await
            }
            ServerMessage::Error { message } => {
                tracing::warn!("Server error: {}", message);
            }
        }
    }

    async fn on_offer(&mut self, offerer: PeerId, description: SessionDescription) {
        self.members.insert(offerer);

        // A failed or closed link is rebuilt for the remote's new offer
        let reusable = self.links.get(&offerer).is_some_and(|entry| {
            !matches!(
                entry.state.phase(),
                SignalingPhase::Failed | SignalingPhase::Closed
            )
        });
        if !reusable {
            if let Some(old) = self.links.remove(&offerer) {
                old.link.close().await;
            }
            match self.open_link(offerer).await {
                Ok(entry) => {
                    self.links.insert(offerer, entry);
                }
                Err(e) => {
                    tracing::warn!("Failed to create link for {}: {}", offerer, e);
                    return;
                }
            }
        }

        let decision = match self.links.get_mut(&offerer) {
            Some(entry) => entry.state.remote_offer(),
            None => return,
        };

        match decision {
            Ok(OfferDecision::Accept) => {}
            Ok(OfferDecision::AcceptAfterRollback) => {
                tracing::debug!("Offer collision with {}; discarding our offer", offerer);
                if let Err(e) = self.replace_link(offerer).await {
                    tracing::warn!("Failed to rebuild link for {}: {}", offerer, e);
                    self.link_failed(offerer).await;
                    return;
                }
            }
            Ok(OfferDecision::Ignore) => {
                tracing::debug!("Offer collision with {}; keeping our offer", offerer);
                return;
            }
            Err(e) => {
                tracing::warn!("Cannot accept offer from {}: {}", offerer, e);
                return;
            }
        }

        let Some(link) = self.links.get(&offerer).map(|entry| entry.link.clone()) else {
            return;
        };

        if let Err(e) = link.set_remote_description(description).await {
            tracing::warn!("Failed to apply offer from {}: {}", offerer, e);
            self.link_failed(offerer).await;
            return;
        }
        self.flush_candidates(offerer, &link).await;

        match link.create_answer().await {
            Ok(answer) => {
                if let Some(entry) = self.links.get_mut(&offerer) {
                    if let Err(e) = entry.state.answer_sent() {
                        tracing::warn!("Answer to {} out of order: {}", offerer, e);
                    }
                }
                self.send(ClientMessage::Answer {
                    target: offerer,
                    description: answer,
                });
            }
            Err(e) => {
                tracing::warn!("Failed to answer {}: {}", offerer, e);
                self.link_failed(offerer).await;
            }
        }
    }

    async fn on_answer(&mut self, answerer: PeerId, description: SessionDescription) {
        let Some(entry) = self.links.get_mut(&answerer) else {
            tracing::debug!("Answer from {} without a link", answerer);
            return;
        };

        match entry.state.remote_answer() {
            Ok(AnswerDecision::Apply) => {}
            Ok(AnswerDecision::IgnoreStale) => {
                tracing::debug!("Ignoring stale answer from {}", answerer);
                return;
            }
            Err(e) => {
                tracing::debug!("Ignoring answer from {}: {}", answerer, e);
                return;
            }
        }

        let link = entry.link.clone();
        if let Err(e) = link.set_remote_description(description).await {
            tracing::warn!("Failed to apply answer from {}: {}", answerer, e);
            self.link_failed(answerer).await;
            return;
        }
        self.flush_candidates(answerer, &link).await;
    }

    async fn on_candidate(&mut self, sender: PeerId, candidate: IceCandidate) {
        let Some(entry) = self.links.get_mut(&sender) else {
            tracing::debug!("Dropping candidate from {}: no link", sender);
            return;
        };

        match entry.state.remote_candidate(candidate) {
            CandidateAction::Apply(candidate) => {
                let link = entry.link.clone();
                if let Err(e) = link.add_remote_candidate(candidate).await {
                    tracing::debug!("Candidate from {} rejected: {}", sender, e);
                }
            }
            CandidateAction::Queued => {
                tracing::debug!("Queued early candidate from {}", sender);
            }
            CandidateAction::Dropped => {
                tracing::debug!("Dropped candidate for closed link to {}", sender);
            }
        }
    }

    async fn handle_link(&mut self, peer: PeerId, generation: u64, event: LinkEvent) {
        let current = self
            .links
            .get(&peer)
            .is_some_and(|entry| entry.generation == generation);
        if !current {
            tracing::debug!("Ignoring event from replaced link to {}", peer);
            return;
        }

        match event {
            LinkEvent::LocalCandidate(candidate) => {
                self.send(ClientMessage::IceCandidate {
                    target: peer,
                    candidate,
                });
            }
            LinkEvent::State(LinkState::Connected) => {
                tracing::info!("Audio link to {} connected", peer);
                self.attempts.remove(&peer);
            }
            LinkEvent::State(LinkState::Failed) => self.link_failed(peer).await,
            LinkEvent::State(state) => {
                tracing::debug!("Link to {} is {:?}", peer, state);
            }
        }
    }

    async fn link_failed(&mut self, peer: PeerId) {
        let Some(entry) = self.links.get_mut(&peer) else {
            return;
        };
        entry.state.link_failed();
        let initiates = entry.state.initiates_reconnect();
        let link = entry.link.clone();
        link.close().await;

        if !initiates {
            tracing::info!("Link to {} failed; waiting for it to re-offer", peer);
            return;
        }

        let attempt = {
            let count = self.attempts.entry(peer).or_insert(0);
            *count += 1;
            *count
        };

        match self.policy.delay_for(attempt) {
            Some(delay) => {
                tracing::info!(
                    "Link to {} failed; retry {}/{} in {:?}",
                    peer,
                    attempt,
                    self.policy.max_attempts,
                    delay
                );
                let tx = self.events_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(SessionEvent::Retry { peer });
                });
            }
            None => {
                tracing::warn!(
                    "Giving up on {} after {} attempts",
                    peer,
                    self.policy.max_attempts
                );
            }
        }
    }

    async fn retry(&mut self, peer: PeerId) {
        if !self.members.contains(&peer) {
            tracing::debug!("Skipping retry for {}: no longer in the room", peer);
            return;
        }

        let failed = self
            .links
            .get(&peer)
            .is_none_or(|entry| entry.state.phase() == SignalingPhase::Failed);
        if !failed {
            tracing::debug!("Link to {} already re-established", peer);
            return;
        }

        self.links.remove(&peer);
        self.offer_to(peer).await;
    }

    async fn offer_to(&mut self, peer: PeerId) {
        let entry = match self.open_link(peer).await {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!("Failed to create link for {}: {}", peer, e);
                return;
            }
        };
        let link = entry.link.clone();
        self.links.insert(peer, entry);

        match link.create_offer().await {
            Ok(description) => {
                if let Some(entry) = self.links.get_mut(&peer) {
                    if let Err(e) = entry.state.local_offer_sent() {
                        tracing::warn!("Offer to {} out of order: {}", peer, e);
                        return;
                    }
                }
                tracing::debug!("Sending offer to {}", peer);
                self.send(ClientMessage::Offer {
                    target: peer,
                    description,
                });
            }
            Err(e) => {
                tracing::warn!("Failed to create offer for {}: {}", peer, e);
                self.link_failed(peer).await;
            }
        }
    }

    async fn open_link(&mut self, peer: PeerId) -> Result<PeerLink, LinkError> {
        self.next_generation += 1;
        let generation = self.next_generation;
        let events = LinkEvents::new(peer, generation, self.events_tx.clone());
        let link = self.factory.create(peer, events).await?;

        Ok(PeerLink {
            state: PeerConnectionState::new(self.local, peer),
            link,
            generation,
        })
    }

    /// Swap in a fresh link, keeping the negotiation state
    async fn replace_link(&mut self, peer: PeerId) -> Result<(), LinkError> {
        self.next_generation += 1;
        let generation = self.next_generation;
        let events = LinkEvents::new(peer, generation, self.events_tx.clone());
        let link = self.factory.create(peer, events).await?;

        if let Some(entry) = self.links.get_mut(&peer) {
            let old = std::mem::replace(&mut entry.link, link);
            entry.generation = generation;
            old.close().await;
        }
        Ok(())
    }

    async fn flush_candidates(&mut self, peer: PeerId, link: &Arc<dyn MediaLink>) {
        let queued = match self.links.get_mut(&peer) {
            Some(entry) => entry.state.remote_description_applied(),
            None => return,
        };

        for candidate in queued {
            if let Err(e) = link.add_remote_candidate(candidate).await {
                tracing::debug!("Queued candidate from {} rejected: {}", peer, e);
            }
        }
    }

    async fn drop_peer(&mut self, peer: PeerId) {
        self.attempts.remove(&peer);
        if let Some(mut entry) = self.links.remove(&peer) {
            let _ = entry.state.close();
            entry.link.close().await;
        }
    }

    async fn close_all(&mut self) {
        let links: Vec<(PeerId, PeerLink)> = self.links.drain().collect();
        for (peer, mut entry) in links {
            let _ = entry.state.close();
            entry.link.close().await;
            tracing::debug!("Closed link to {}", peer);
        }
        self.attempts.clear();
    }

    fn send(&self, message: ClientMessage) {
        if self.outbound.send(message).is_err() {
            tracing::debug!("Signaling socket closed; dropping outbound message");
        }
    }
}
