//! Peer-connection negotiation state
//!
//! A [`PeerConnectionState`] tracks where one peer-to-peer link is in the
//! offer/answer exchange and holds remote ICE candidates that arrived before
//! a remote description could take them. It performs no I/O: the mesh session
//! asks it what to do and carries the decision out on the media link.

use std::collections::VecDeque;
use std::time::Duration;
use thiserror::Error;
use voxroom_protocol::{IceCandidate, PeerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingPhase {
    Idle,
    HaveLocalOffer,
    HaveRemoteOffer,
    Stable,
    Closed,
    Failed,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("Connection already closed")]
    AlreadyClosed,

    #[error("Cannot {action} while {phase:?}")]
    InvalidTransition {
        action: &'static str,
        phase: SignalingPhase,
    },
}

/// What to do with an incoming offer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferDecision {
    Accept,
    /// Glare, and we are polite: drop our own offer (and its link) first
    AcceptAfterRollback,
    /// Glare, and we are impolite: our offer wins
    Ignore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerDecision {
    Apply,
    /// No offer of ours is outstanding
    IgnoreStale,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CandidateAction {
    /// A remote description is in place; apply it now
    Apply(IceCandidate),
    Queued,
    Dropped,
}

#[derive(Debug)]
pub struct PeerConnectionState {
    local: PeerId,
    remote: PeerId,
    phase: SignalingPhase,
    remote_description_applied: bool,
    pending_candidates: VecDeque<IceCandidate>,
    /// The remote has offered or answered on this link
    remote_engaged: bool,
    /// We ignored a colliding offer; its candidates are dropped until our answer lands
    discard_glare_candidates: bool,
}

impl PeerConnectionState {
    pub fn new(local: PeerId, remote: PeerId) -> Self {
        Self {
            local,
            remote,
            phase: SignalingPhase::Idle,
            remote_description_applied: false,
            pending_candidates: VecDeque::new(),
            remote_engaged: false,
            discard_glare_candidates: false,
        }
    }

    pub fn remote(&self) -> PeerId {
        self.remote
    }

    pub fn phase(&self) -> SignalingPhase {
        self.phase
    }

    /// The larger id yields on glare
    pub fn is_polite(&self) -> bool {
        self.local > self.remote
    }

    /// The smaller id re-offers after a link failure. A remote that never
    /// offered or answered has no link to retry from, so our side does.
    pub fn initiates_reconnect(&self) -> bool {
        self.local < self.remote || !self.remote_engaged
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    pub fn local_offer_sent(&mut self) -> Result<(), NegotiationError> {
        match self.phase {
            SignalingPhase::Idle | SignalingPhase::Stable => {
                self.phase = SignalingPhase::HaveLocalOffer;
                Ok(())
            }
            SignalingPhase::Closed => Err(NegotiationError::AlreadyClosed),
            phase => Err(NegotiationError::InvalidTransition {
                action: "send an offer",
                phase,
            }),
        }
    }

    pub fn remote_offer(&mut self) -> Result<OfferDecision, NegotiationError> {
        match self.phase {
            SignalingPhase::Idle | SignalingPhase::Stable => {
                self.phase = SignalingPhase::HaveRemoteOffer;
                self.remote_engaged = true;
                Ok(OfferDecision::Accept)
            }
            SignalingPhase::HaveLocalOffer if self.is_polite() => {
                self.phase = SignalingPhase::HaveRemoteOffer;
                self.remote_engaged = true;
                // The link is rebuilt, so nothing has been applied to it yet
                self.remote_description_applied = false;
                Ok(OfferDecision::AcceptAfterRollback)
            }
            SignalingPhase::HaveLocalOffer => {
                // Candidates so far belong to the offer the remote abandons
                self.pending_candidates.clear();
                self.discard_glare_candidates = true;
                Ok(OfferDecision::Ignore)
            }
            SignalingPhase::HaveRemoteOffer => Ok(OfferDecision::Ignore),
            SignalingPhase::Closed | SignalingPhase::Failed => Err(NegotiationError::AlreadyClosed),
        }
    }

    pub fn answer_sent(&mut self) -> Result<(), NegotiationError> {
        match self.phase {
            SignalingPhase::HaveRemoteOffer => {
                self.phase = SignalingPhase::Stable;
                Ok(())
            }
            SignalingPhase::Closed => Err(NegotiationError::AlreadyClosed),
            phase => Err(NegotiationError::InvalidTransition {
                action: "send an answer",
                phase,
            }),
        }
    }

    pub fn remote_answer(&mut self) -> Result<AnswerDecision, NegotiationError> {
        match self.phase {
            SignalingPhase::HaveLocalOffer => {
                self.phase = SignalingPhase::Stable;
                self.remote_engaged = true;
                self.discard_glare_candidates = false;
                Ok(AnswerDecision::Apply)
            }
            SignalingPhase::Closed | SignalingPhase::Failed => Err(NegotiationError::AlreadyClosed),
            _ => Ok(AnswerDecision::IgnoreStale),
        }
    }

    pub fn remote_candidate(&mut self, candidate: IceCandidate) -> CandidateAction {
        match self.phase {
            SignalingPhase::Closed | SignalingPhase::Failed => CandidateAction::Dropped,
            SignalingPhase::HaveLocalOffer if self.discard_glare_candidates => {
                CandidateAction::Dropped
            }
            _ if self.remote_description_applied => CandidateAction::Apply(candidate),
            _ => {
                self.pending_candidates.push_back(candidate);
                CandidateAction::Queued
            }
        }
    }

    /// Mark the remote description as set; returns queued candidates in arrival order
    pub fn remote_description_applied(&mut self) -> Vec<IceCandidate> {
        self.remote_description_applied = true;
        self.pending_candidates.drain(..).collect()
    }

    pub fn link_failed(&mut self) {
        if self.phase != SignalingPhase::Closed {
            self.phase = SignalingPhase::Failed;
        }
        self.pending_candidates.clear();
    }

    pub fn close(&mut self) -> Result<(), NegotiationError> {
        if self.phase == SignalingPhase::Closed {
            return Err(NegotiationError::AlreadyClosed);
        }
        self.phase = SignalingPhase::Closed;
        self.pending_candidates.clear();
        Ok(())
    }
}

/// Fixed-delay retry schedule for failed links
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub delay: Duration,
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    pub fn new(delay: Duration, max_attempts: u32) -> Self {
        Self {
            delay,
            max_attempts,
        }
    }

    /// Delay before retry number `attempt` (1-based), or `None` once exhausted
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        (attempt <= self.max_attempts).then_some(self.delay)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(2), 5)
    }
}
