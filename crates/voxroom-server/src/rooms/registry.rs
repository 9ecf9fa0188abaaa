//! Room Registry
//!
//! Maps rooms to their members. Each room is guarded by its own mutex; the
//! room map and the peer→room index sit behind `RwLock`s that are only held
//! for short lookups. Membership observers run while the room's mutex is
//! held, so notifications leave in the same order as the mutations that
//! produced them.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use voxroom_protocol::{PeerId, ProtocolError, RoomId};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error(transparent)]
    InvalidRoom(#[from] ProtocolError),

    #[error("Room {0} is full")]
    RoomFull(RoomId),
}

/// Receives membership changes for broadcasting
#[async_trait]
pub trait MembershipObserver: Send + Sync {
    /// `existing` is the membership snapshot before `peer_id` was added
    async fn peer_joined(&self, room_id: &RoomId, peer_id: PeerId, existing: &[PeerId]);

    /// `remaining` is the membership after `peer_id` was removed
    async fn peer_left(&self, room_id: &RoomId, peer_id: PeerId, remaining: &[PeerId]);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinOutcome {
    pub room_id: RoomId,
    /// Members other than the joiner, in join order
    pub existing: Vec<PeerId>,
    /// Room the peer implicitly left, if it was elsewhere
    pub previous: Option<LeaveOutcome>,
    /// The peer was already a member; nothing changed and nobody was notified
    pub rejoined: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaveOutcome {
    pub room_id: RoomId,
    pub remaining: Vec<PeerId>,
    pub room_closed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoomSummary {
    pub room_id: RoomId,
    pub members: usize,
}

#[derive(Default)]
struct RoomState {
    /// Join order is kept so snapshots are stable
    members: Vec<PeerId>,
    /// Set once the room emptied and was unlinked from the map
    closed: bool,
}

pub struct RoomRegistry {
    rooms: RwLock<HashMap<RoomId, Arc<Mutex<RoomState>>>>,
    memberships: RwLock<HashMap<PeerId, RoomId>>,
    /// 0 = unlimited
    max_peers_per_room: usize,
    observer: Arc<dyn MembershipObserver>,
}

impl RoomRegistry {
    pub fn new(observer: Arc<dyn MembershipObserver>, max_peers_per_room: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            memberships: RwLock::new(HashMap::new()),
            max_peers_per_room,
            observer,
        }
    }

    /// Add `peer_id` to the room named `room_name`, leaving its previous room first
    pub async fn join(&self, peer_id: PeerId, room_name: &str) -> Result<JoinOutcome, RegistryError> {
        let room_id = RoomId::sanitize(room_name)?;

        let current = self.room_of(peer_id).await;
        if current.as_ref() == Some(&room_id) {
            let existing = self
                .members_of(&room_id)
                .await
                .into_iter()
                .filter(|p| *p != peer_id)
                .collect();
            return Ok(JoinOutcome {
                room_id,
                existing,
                previous: None,
                rejoined: true,
            });
        }

        // Cheap pre-check so a full room does not cost the peer its current room
        if self.is_full(&room_id).await {
            return Err(RegistryError::RoomFull(room_id));
        }

        let previous = match current {
            Some(_) => self.leave(peer_id).await,
            None => None,
        };

        loop {
            let room = {
                let mut rooms = self.rooms.write().await;
                rooms
                    .entry(room_id.clone())
                    .or_insert_with(|| {
                        tracing::info!("Created room {}", room_id);
                        Arc::new(Mutex::new(RoomState::default()))
                    })
                    .clone()
            };

            let mut state = room.lock().await;
            if state.closed {
                // Lost a race with the last member leaving; retry on a fresh record
                continue;
            }

            if self.max_peers_per_room > 0 && state.members.len() >= self.max_peers_per_room {
                tracing::warn!("Room {} is full, rejecting peer {}", room_id, peer_id);
                return Err(RegistryError::RoomFull(room_id));
            }

            let existing = state.members.clone();
            state.members.push(peer_id);
            self.memberships
                .write()
                .await
                .insert(peer_id, room_id.clone());

            tracing::info!(
                "Peer {} joined room {} ({} members)",
                peer_id,
                room_id,
                state.members.len()
            );

            self.observer.peer_joined(&room_id, peer_id, &existing).await;

            return Ok(JoinOutcome {
                room_id,
                existing,
                previous,
                rejoined: false,
            });
        }
    }

    /// Remove `peer_id` from its room. Returns `None` when it had no room, so
    /// concurrent or repeated calls notify at most once.
    pub async fn leave(&self, peer_id: PeerId) -> Option<LeaveOutcome> {
        let room_id = self.memberships.write().await.remove(&peer_id)?;

        let Some(room) = self.rooms.read().await.get(&room_id).cloned() else {
            tracing::warn!("Peer {} was indexed in missing room {}", peer_id, room_id);
            return Some(LeaveOutcome {
                room_id,
                remaining: Vec::new(),
                room_closed: true,
            });
        };

        let mut state = room.lock().await;
        state.members.retain(|p| *p != peer_id);
        let remaining = state.members.clone();
        let room_closed = remaining.is_empty();

        if room_closed {
            state.closed = true;
            let mut rooms = self.rooms.write().await;
            if rooms
                .get(&room_id)
                .is_some_and(|current| Arc::ptr_eq(current, &room))
            {
                rooms.remove(&room_id);
            }
            tracing::info!("Room {} is empty and was removed", room_id);
        }

        tracing::info!("Peer {} left room {}", peer_id, room_id);

        self.observer.peer_left(&room_id, peer_id, &remaining).await;

        Some(LeaveOutcome {
            room_id,
            remaining,
            room_closed,
        })
    }

    pub async fn members_of(&self, room_id: &RoomId) -> Vec<PeerId> {
        let room = self.rooms.read().await.get(room_id).cloned();
        match room {
            Some(room) => room.lock().await.members.clone(),
            None => Vec::new(),
        }
    }

    pub async fn room_of(&self, peer_id: PeerId) -> Option<RoomId> {
        self.memberships.read().await.get(&peer_id).cloned()
    }

    /// True when both peers are currently members of the same room
    pub async fn are_co_members(&self, a: PeerId, b: PeerId) -> bool {
        let memberships = self.memberships.read().await;
        match (memberships.get(&a), memberships.get(&b)) {
            (Some(room_a), Some(room_b)) => room_a == room_b,
            _ => false,
        }
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn summaries(&self) -> Vec<RoomSummary> {
        let rooms: Vec<_> = self
            .rooms
            .read()
            .await
            .iter()
            .map(|(id, room)| (id.clone(), room.clone()))
            .collect();

        let mut summaries = Vec::with_capacity(rooms.len());
        for (room_id, room) in rooms {
            let members = room.lock().await.members.len();
            summaries.push(RoomSummary { room_id, members });
        }
        summaries.sort_by(|a, b| a.room_id.cmp(&b.room_id));
        summaries
    }

    /// Drop every room without notifying anyone (server shutdown)
    pub async fn clear(&self) {
        self.memberships.write().await.clear();
        let rooms: Vec<_> = self.rooms.write().await.drain().map(|(_, room)| room).collect();

        // A last member leaving holds its room while it waits for the map
        for room in rooms {
            room.lock().await.closed = true;
        }
    }

    async fn is_full(&self, room_id: &RoomId) -> bool {
        if self.max_peers_per_room == 0 {
            return false;
        }
        self.members_of(room_id).await.len() >= self.max_peers_per_room
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Event {
        Joined(RoomId, PeerId, Vec<PeerId>),
        Left(RoomId, PeerId, Vec<PeerId>),
    }

    #[derive(Default)]
    struct Recorder {
        events: StdMutex<Vec<Event>>,
    }

    impl Recorder {
        fn take(&self) -> Vec<Event> {
            std::mem::take(&mut *self.events.lock().unwrap())
        }
    }

    #[async_trait]
    impl MembershipObserver for Recorder {
        async fn peer_joined(&self, room_id: &RoomId, peer_id: PeerId, existing: &[PeerId]) {
            self.events
                .lock()
                .unwrap()
                .push(Event::Joined(room_id.clone(), peer_id, existing.to_vec()));
        }

        async fn peer_left(&self, room_id: &RoomId, peer_id: PeerId, remaining: &[PeerId]) {
            self.events
                .lock()
                .unwrap()
                .push(Event::Left(room_id.clone(), peer_id, remaining.to_vec()));
        }
    }

    fn registry(max: usize) -> (RoomRegistry, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        (RoomRegistry::new(recorder.clone(), max), recorder)
    }

    fn room(name: &str) -> RoomId {
        RoomId::sanitize(name).unwrap()
    }

    #[tokio::test]
    async fn join_returns_snapshot_excluding_joiner() {
        let (registry, _) = registry(0);
        let (a, b, c) = (PeerId::new(), PeerId::new(), PeerId::new());

        assert!(registry.join(a, "r1").await.unwrap().existing.is_empty());
        assert_eq!(registry.join(b, "r1").await.unwrap().existing, vec![a]);
        assert_eq!(registry.join(c, "r1").await.unwrap().existing, vec![a, b]);
        assert_eq!(registry.members_of(&room("r1")).await, vec![a, b, c]);
    }

    #[tokio::test]
    async fn joining_another_room_leaves_the_previous_one() {
        let (registry, recorder) = registry(0);
        let (a, b) = (PeerId::new(), PeerId::new());

        registry.join(a, "x").await.unwrap();
        registry.join(b, "x").await.unwrap();
        recorder.take();

        let outcome = registry.join(a, "y").await.unwrap();
        let previous = outcome.previous.unwrap();
        assert_eq!(previous.room_id, room("x"));
        assert_eq!(previous.remaining, vec![b]);

        assert_eq!(
            recorder.take(),
            vec![
                Event::Left(room("x"), a, vec![b]),
                Event::Joined(room("y"), a, vec![]),
            ]
        );
        assert_eq!(registry.room_of(a).await, Some(room("y")));
    }

    #[tokio::test]
    async fn empty_rooms_are_removed() {
        let (registry, _) = registry(0);
        let a = PeerId::new();

        registry.join(a, "lonely").await.unwrap();
        assert_eq!(registry.room_count().await, 1);

        let outcome = registry.leave(a).await.unwrap();
        assert!(outcome.room_closed);
        assert_eq!(registry.room_count().await, 0);
        assert!(registry.members_of(&room("lonely")).await.is_empty());
    }

    #[tokio::test]
    async fn leave_notifies_exactly_once() {
        let (registry, recorder) = registry(0);
        let (a, b) = (PeerId::new(), PeerId::new());

        registry.join(a, "r").await.unwrap();
        registry.join(b, "r").await.unwrap();
        recorder.take();

        assert!(registry.leave(b).await.is_some());
        assert!(registry.leave(b).await.is_none());
        assert_eq!(recorder.take(), vec![Event::Left(room("r"), b, vec![a])]);
    }

    #[tokio::test]
    async fn rejoining_same_room_is_silent() {
        let (registry, recorder) = registry(0);
        let (a, b) = (PeerId::new(), PeerId::new());

        registry.join(a, "r").await.unwrap();
        registry.join(b, "r").await.unwrap();
        recorder.take();

        let outcome = registry.join(b, "r").await.unwrap();
        assert!(outcome.rejoined);
        assert_eq!(outcome.existing, vec![a]);
        assert!(recorder.take().is_empty());
    }

    #[tokio::test]
    async fn full_room_rejects_without_leaving_current_room() {
        let (registry, _) = registry(1);
        let (a, b) = (PeerId::new(), PeerId::new());

        registry.join(a, "full").await.unwrap();
        registry.join(b, "other").await.unwrap();

        assert_eq!(
            registry.join(b, "full").await,
            Err(RegistryError::RoomFull(room("full")))
        );
        assert_eq!(registry.room_of(b).await, Some(room("other")));
    }

    #[tokio::test]
    async fn invalid_name_is_rejected() {
        let (registry, _) = registry(0);
        assert!(matches!(
            registry.join(PeerId::new(), "???").await,
            Err(RegistryError::InvalidRoom(_))
        ));
        assert_eq!(registry.room_count().await, 0);
    }

    #[tokio::test]
    async fn concurrent_join_and_leave_keep_membership_exact() {
        let (registry, _) = registry(0);
        let registry = Arc::new(registry);
        let peers: Vec<PeerId> = (0..32).map(|_| PeerId::new()).collect();

        let mut handles = Vec::new();
        for (i, peer) in peers.iter().copied().enumerate() {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                registry.join(peer, "busy").await.unwrap();
                if i % 2 == 0 {
                    registry.leave(peer).await;
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let mut members = registry.members_of(&room("busy")).await;
        members.sort();
        let mut expected: Vec<PeerId> = peers
            .iter()
            .enumerate()
            .filter(|(i, _)| i % 2 == 1)
            .map(|(_, p)| *p)
            .collect();
        expected.sort();
        assert_eq!(members, expected);
    }

    /// Holds the first departure inside the observer until released
    #[derive(Default)]
    struct HeldDeparture {
        held: std::sync::atomic::AtomicBool,
        entered: tokio::sync::Notify,
        release: tokio::sync::Notify,
    }

    #[async_trait]
    impl MembershipObserver for HeldDeparture {
        async fn peer_joined(&self, _room_id: &RoomId, _peer_id: PeerId, _existing: &[PeerId]) {}

        async fn peer_left(&self, _room_id: &RoomId, _peer_id: PeerId, _remaining: &[PeerId]) {
            if !self.held.swap(true, std::sync::atomic::Ordering::SeqCst) {
                self.entered.notify_one();
                self.release.notified().await;
            }
        }
    }

    #[tokio::test]
    async fn clear_does_not_wait_on_a_leaving_last_member() {
        let observer = Arc::new(HeldDeparture::default());
        let registry = Arc::new(RoomRegistry::new(observer.clone(), 0));
        let (a, b) = (PeerId::new(), PeerId::new());
        registry.join(a, "r").await.unwrap();
        registry.join(b, "r").await.unwrap();

        // b's departure holds the room while its notification is pending
        let leave_b = tokio::spawn({
            let registry = registry.clone();
            async move { registry.leave(b).await }
        });
        observer.entered.notified().await;

        // a queues on the room lock and will need the room map once it gets it
        let leave_a = tokio::spawn({
            let registry = registry.clone();
            async move { registry.leave(a).await }
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let clear = tokio::spawn({
            let registry = registry.clone();
            async move { registry.clear().await }
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        observer.release.notify_one();

        let finished = tokio::time::timeout(std::time::Duration::from_secs(2), async {
            leave_b.await.unwrap();
            leave_a.await.unwrap();
            clear.await.unwrap();
        })
        .await;
        assert!(finished.is_ok(), "clear and leave deadlocked");
        assert_eq!(registry.room_count().await, 0);
    }

    #[tokio::test]
    async fn co_membership_requires_same_room() {
        let (registry, _) = registry(0);
        let (a, b, c) = (PeerId::new(), PeerId::new(), PeerId::new());
        registry.join(a, "x").await.unwrap();
        registry.join(b, "x").await.unwrap();
        registry.join(c, "y").await.unwrap();

        assert!(registry.are_co_members(a, b).await);
        assert!(!registry.are_co_members(a, c).await);
    }
}
