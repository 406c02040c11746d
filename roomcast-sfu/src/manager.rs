//! SFU Manager - room registry, role assignment and track fan-out
//!
//! Locking:
//! - `rooms` (reader/writer) guards room existence only. It is never held
//!   across an await.
//! - each room's async mutex guards its publisher, subscribers and the
//!   publisher's track list. Role resolution, negotiation and commit happen
//!   under it, as does "create track and attach to every subscriber".
//! - the only nesting is room lock -> registry lock (when unlinking a room).
//!
//! Because "snapshot tracks for a joining subscriber" and "attach a new track
//! to all current subscribers" both run under the same room lock, every
//! subscriber receives every relay track exactly once.

use futures::future::join_all;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SfuConfig;
use crate::engine::{
    negotiate, EngineSession, IceCandidate, InboundTrack, MediaSession, SessionDescription,
    SessionEngine, SessionEvent,
};
use crate::error::{Result, SfuError};
use crate::peer::{Peer, PeerRole, PeerState};
use crate::room::{RoomSnapshot, RoomState, SfuRoom};
use crate::track::{spawn_relay, PublishedTrack};
use crate::types::{PeerKey, RoomId, UserId};

type Room<E> = SfuRoom<<E as SessionEngine>::Session>;
type State<E> = RoomState<<E as SessionEngine>::Session>;

/// Outcome of a successful offer
#[derive(Debug, Clone)]
pub struct Negotiated {
    pub role: PeerRole,
    pub answer: SessionDescription,
}

/// Global SFU statistics
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ManagerStats {
    pub active_rooms: usize,
    pub publishers: usize,
    pub subscribers: usize,
    pub relay_tracks: usize,
    pub packets_relayed: u64,
    pub bytes_relayed: u64,
}

/// SFU Manager - owns every room and the sessions inside them
pub struct SfuManager<E: SessionEngine> {
    config: Arc<SfuConfig>,
    engine: Arc<E>,
    rooms: RwLock<HashMap<RoomId, Arc<Room<E>>>>,
}

impl<E: SessionEngine> SfuManager<E> {
    pub fn new(engine: E, config: SfuConfig) -> Self {
        info!(
            max_rooms = config.max_rooms,
            max_subscribers_per_room = config.max_subscribers_per_room,
            ice_servers = config.ice_servers.len(),
            "SFU Manager initialized"
        );
        Self {
            config: Arc::new(config),
            engine: Arc::new(engine),
            rooms: RwLock::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn config(&self) -> &SfuConfig {
        &self.config
    }

    #[must_use]
    pub fn engine(&self) -> &Arc<E> {
        &self.engine
    }

    /// Negotiate a session for `user_id` and place it in the room.
    ///
    /// With `requested == None` the role is inferred: the first joiner of a
    /// room without a publisher publishes, everyone after subscribes.
    pub async fn handle_offer(
        &self,
        room_id: &RoomId,
        user_id: &UserId,
        requested: Option<PeerRole>,
        offer: SessionDescription,
    ) -> Result<Negotiated> {
        loop {
            let room = self.get_or_create_room(room_id)?;
            let mut guard = room.lock().await;
            if guard.is_closed() {
                // Torn down between lookup and lock; it is already unlinked.
                debug!(room_id = %room_id, "Room closed while joining, retrying");
                continue;
            }

            let result = self
                .admit(&room, &mut guard, user_id, requested, offer)
                .await;
            if result.is_err() && guard.is_empty() {
                guard.mark_closed();
                self.unlink_room(&room);
            }
            return result;
        }
    }

    async fn admit(
        &self,
        room: &Arc<Room<E>>,
        state: &mut State<E>,
        user_id: &UserId,
        requested: Option<PeerRole>,
        offer: SessionDescription,
    ) -> Result<Negotiated> {
        let role = self.resolve_role(&room.id, state, user_id, requested)?;
        let key = PeerKey::new(room.id.clone(), user_id.clone());

        let EngineSession { session, events } = self
            .engine
            .create_session(&key)
            .await
            .map_err(SfuError::Negotiation)?;

        if role == PeerRole::Subscriber {
            Self::attach_snapshot(state, &key, &session).await;
        }

        let answer = match negotiate(session.as_ref(), offer).await {
            Ok(answer) => answer,
            Err(e) => {
                warn!(peer = %key, role = %role, error = %e, "Negotiation failed");
                if let Err(close_err) = session.close().await {
                    debug!(peer = %key, error = %close_err, "Failed to close rejected session");
                }
                return Err(SfuError::Negotiation(e));
            }
        };

        let peer = Peer::new(room.id.clone(), user_id.clone(), role, session);
        Self::spawn_coordinator(Arc::clone(room), &peer, events);

        match role {
            PeerRole::Publisher => state.publisher = Some(peer),
            PeerRole::Subscriber => {
                state.subscribers.insert(user_id.clone(), peer);
            }
        }

        info!(
            room_id = %room.id,
            user_id = %user_id,
            role = %role,
            subscribers = state.subscribers.len(),
            "Peer joined room"
        );

        Ok(Negotiated { role, answer })
    }

    fn resolve_role(
        &self,
        room_id: &RoomId,
        state: &State<E>,
        user_id: &UserId,
        requested: Option<PeerRole>,
    ) -> Result<PeerRole> {
        if let Some(role) = state.role_of(user_id) {
            return Err(SfuError::PeerExists {
                room_id: room_id.clone(),
                user_id: user_id.clone(),
                role,
            });
        }

        let role = match (requested, state.publisher_id()) {
            (Some(PeerRole::Publisher), Some(current)) => {
                return Err(SfuError::RoleConflict {
                    room_id: room_id.clone(),
                    publisher: current.clone(),
                });
            }
            (Some(role), _) => role,
            (None, None) => PeerRole::Publisher,
            (None, Some(_)) => PeerRole::Subscriber,
        };

        let limit = self.config.max_subscribers_per_room;
        if role == PeerRole::Subscriber && limit > 0 && state.subscribers.len() >= limit {
            warn!(room_id = %room_id, limit, "Subscriber limit reached");
            return Err(SfuError::PeerLimit {
                room_id: room_id.clone(),
                limit,
            });
        }

        Ok(role)
    }

    /// Attach every relay track the publisher has produced so far
    async fn attach_snapshot(state: &State<E>, key: &PeerKey, session: &Arc<E::Session>) {
        let Some(publisher) = &state.publisher else {
            debug!(peer = %key, "No publisher yet, subscriber starts without tracks");
            return;
        };
        for published in publisher.tracks() {
            match session.add_track(Arc::clone(&published.track)).await {
                Ok(()) => {
                    debug!(peer = %key, track_id = %published.id(), "Attached existing track");
                }
                Err(e) => {
                    warn!(peer = %key, track_id = %published.id(), error = %e, "Failed to attach track");
                }
            }
        }
    }

    fn spawn_coordinator(
        room: Arc<Room<E>>,
        peer: &Peer<E::Session>,
        events: mpsc::Receiver<SessionEvent<E::Inbound>>,
    ) {
        let coordinator = Coordinator::<E> {
            room,
            user_id: peer.user_id.clone(),
            role: peer.role,
            state: peer.state_handle(),
            cancel: peer.cancel_token().child_token(),
        };
        tokio::spawn(coordinator.run(events));
    }

    /// Apply a remote candidate. Unknown rooms and peers are ignored.
    pub async fn handle_ice_candidate(
        &self,
        room_id: &RoomId,
        user_id: &UserId,
        candidate: IceCandidate,
    ) -> Result<()> {
        let Some(session) = self.resolve_session(room_id, user_id).await else {
            return Ok(());
        };
        session.add_ice_candidate(candidate).await?;
        debug!(room_id = %room_id, user_id = %user_id, "Applied ICE candidate");
        Ok(())
    }

    /// Like [`Self::handle_ice_candidate`], decoding the wire payload once the
    /// peer is known
    pub async fn handle_ice_candidate_json(
        &self,
        room_id: &RoomId,
        user_id: &UserId,
        payload: serde_json::Value,
    ) -> Result<()> {
        let Some(session) = self.resolve_session(room_id, user_id).await else {
            return Ok(());
        };
        let candidate: IceCandidate = serde_json::from_value(payload)?;
        session.add_ice_candidate(candidate).await?;
        debug!(room_id = %room_id, user_id = %user_id, "Applied ICE candidate");
        Ok(())
    }

    async fn resolve_session(&self, room_id: &RoomId, user_id: &UserId) -> Option<Arc<E::Session>> {
        let Some(room) = self.room(room_id) else {
            debug!(room_id = %room_id, "Candidate for unknown room ignored");
            return None;
        };
        let state = room.lock().await;
        match state.find(user_id) {
            Some(peer) if !peer.is_closed() => Some(Arc::clone(peer.session())),
            Some(_) => {
                debug!(room_id = %room_id, user_id = %user_id, "Candidate for closed peer ignored");
                None
            }
            None => {
                debug!(room_id = %room_id, user_id = %user_id, "Candidate for unknown peer ignored");
                None
            }
        }
    }

    /// Remove a peer. A departing publisher tears down the whole room.
    /// Returns the role the peer held, or `None` if it was not present.
    pub async fn remove_peer(&self, room_id: &RoomId, user_id: &UserId) -> Option<PeerRole> {
        let Some(room) = self.room(room_id) else {
            debug!(room_id = %room_id, user_id = %user_id, "Remove for unknown room ignored");
            return None;
        };
        let mut guard = room.lock().await;
        let state = &mut *guard;

        if state.publisher_id() == Some(user_id) {
            let publisher = state.publisher.take();
            let subscribers: Vec<_> = state.subscribers.drain().map(|(_, peer)| peer).collect();
            if let Some(publisher) = &publisher {
                publisher.close().await;
            }
            join_all(subscribers.iter().map(|peer| peer.close())).await;
            state.mark_closed();
            self.unlink_room(&room);
            info!(
                room_id = %room_id,
                user_id = %user_id,
                closed_subscribers = subscribers.len(),
                "Publisher left, room torn down"
            );
            return Some(PeerRole::Publisher);
        }

        if let Some(subscriber) = state.subscribers.remove(user_id) {
            subscriber.close().await;
            info!(
                room_id = %room_id,
                user_id = %user_id,
                remaining = state.subscribers.len(),
                "Subscriber left room"
            );
            if state.is_empty() {
                state.mark_closed();
                self.unlink_room(&room);
            }
            return Some(PeerRole::Subscriber);
        }

        debug!(room_id = %room_id, user_id = %user_id, "Remove for unknown peer ignored");
        None
    }

    fn get_or_create_room(&self, room_id: &RoomId) -> Result<Arc<Room<E>>> {
        if let Some(room) = self.rooms.read().get(room_id) {
            return Ok(Arc::clone(room));
        }

        let mut rooms = self.rooms.write();
        if let Some(room) = rooms.get(room_id) {
            return Ok(Arc::clone(room));
        }

        // Enforce room limit (0 = unlimited)
        if self.config.max_rooms > 0 && rooms.len() >= self.config.max_rooms {
            warn!(
                current_rooms = rooms.len(),
                max_rooms = self.config.max_rooms,
                "Room limit reached"
            );
            return Err(SfuError::RoomLimit(self.config.max_rooms));
        }

        let room = Arc::new(SfuRoom::new(room_id.clone()));
        rooms.insert(room_id.clone(), Arc::clone(&room));
        info!(room_id = %room_id, total_rooms = rooms.len(), "Created new room");
        Ok(room)
    }

    /// Drop the registry entry if it still points at `room`
    fn unlink_room(&self, room: &Arc<Room<E>>) {
        let mut rooms = self.rooms.write();
        if rooms.get(&room.id).is_some_and(|current| Arc::ptr_eq(current, room)) {
            rooms.remove(&room.id);
            info!(room_id = %room.id, remaining_rooms = rooms.len(), "Room removed");
        }
    }

    fn room(&self, room_id: &RoomId) -> Option<Arc<Room<E>>> {
        self.rooms.read().get(room_id).cloned()
    }

    #[must_use]
    pub fn has_room(&self, room_id: &RoomId) -> bool {
        self.rooms.read().contains_key(room_id)
    }

    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms.read().len()
    }

    #[must_use]
    pub fn room_ids(&self) -> Vec<RoomId> {
        let mut ids: Vec<RoomId> = self.rooms.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn room_snapshot(&self, room_id: &RoomId) -> Option<RoomSnapshot> {
        let room = self.room(room_id)?;
        Some(room.snapshot().await)
    }

    pub async fn stats(&self) -> ManagerStats {
        let rooms: Vec<_> = self.rooms.read().values().cloned().collect();
        let mut stats = ManagerStats {
            active_rooms: rooms.len(),
            ..Default::default()
        };
        for room in rooms {
            let room_stats = room.get_stats().await;
            stats.publishers += usize::from(room_stats.has_publisher);
            stats.subscribers += room_stats.subscriber_count;
            stats.relay_tracks += room_stats.track_count;
            stats.packets_relayed += room_stats.packets_relayed;
            stats.bytes_relayed += room_stats.bytes_relayed;
        }
        stats
    }

    /// Close every session and forget every room
    pub async fn shutdown(&self) {
        let rooms: Vec<_> = self.rooms.write().drain().map(|(_, room)| room).collect();
        info!(rooms = rooms.len(), "Shutting down SFU");
        for room in rooms {
            let mut guard = room.lock().await;
            let state = &mut *guard;
            if let Some(publisher) = state.publisher.take() {
                publisher.close().await;
            }
            let subscribers: Vec<_> = state.subscribers.drain().map(|(_, peer)| peer).collect();
            join_all(subscribers.iter().map(|peer| peer.close())).await;
            state.mark_closed();
        }
    }
}

/// Drains one peer's engine events
struct Coordinator<E: SessionEngine> {
    room: Arc<Room<E>>,
    user_id: UserId,
    role: PeerRole,
    state: Arc<parking_lot::RwLock<PeerState>>,
    cancel: CancellationToken,
}

impl<E: SessionEngine> Coordinator<E> {
    async fn run(self, mut events: mpsc::Receiver<SessionEvent<E::Inbound>>) {
        loop {
            let event = tokio::select! {
                () = self.cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            match event {
                SessionEvent::ConnectionState(connection_state) => {
                    self.on_connection_state(connection_state);
                }
                SessionEvent::Track(inbound) if self.role == PeerRole::Publisher => {
                    self.publish(inbound).await;
                }
                SessionEvent::Track(inbound) => {
                    warn!(
                        room_id = %self.room.id,
                        user_id = %self.user_id,
                        track_id = %inbound.id(),
                        "Ignoring inbound track from subscriber"
                    );
                }
            }
        }
        debug!(room_id = %self.room.id, user_id = %self.user_id, "Peer coordinator stopped");
    }

    fn on_connection_state(&self, connection_state: crate::engine::ConnectionState) {
        let mut state = self.state.write();
        let current = *state;
        let next = current.on_connection_state(connection_state);
        if next == current {
            debug!(
                room_id = %self.room.id,
                user_id = %self.user_id,
                connection_state = ?connection_state,
                "Connection state changed"
            );
        } else {
            info!(
                room_id = %self.room.id,
                user_id = %self.user_id,
                role = %self.role,
                from = ?current,
                to = ?next,
                "Peer state changed"
            );
            *state = next;
        }
    }

    /// Create the relay track, record it, start its relay task and attach it
    /// to every current subscriber, all under the room lock.
    async fn publish(&self, inbound: E::Inbound) {
        let track_id = inbound.id();
        let kind = inbound.kind();
        let relay = match inbound.create_relay() {
            Ok(relay) => relay,
            Err(e) => {
                warn!(
                    room_id = %self.room.id,
                    track_id = %track_id,
                    error = %e,
                    "Failed to create relay track, skipping media line"
                );
                return;
            }
        };
        let published = PublishedTrack::new(relay);

        let mut guard = self.room.lock().await;
        let state = &mut *guard;
        if self.cancel.is_cancelled() {
            debug!(room_id = %self.room.id, track_id = %track_id, "Publisher gone, dropping track");
            return;
        }
        let Some(publisher) = state
            .publisher
            .as_mut()
            .filter(|publisher| publisher.user_id == self.user_id)
        else {
            return;
        };

        publisher.push_track(published.clone());
        spawn_relay(
            self.room.id.clone(),
            inbound,
            Arc::clone(&published.track),
            Arc::clone(&published.stats),
            self.cancel.child_token(),
        );

        let mut attached = 0usize;
        for subscriber in state.subscribers.values() {
            match subscriber.session().add_track(Arc::clone(&published.track)).await {
                Ok(()) => attached += 1,
                Err(e) => {
                    warn!(
                        room_id = %self.room.id,
                        track_id = %track_id,
                        subscriber = %subscriber.user_id,
                        error = %e,
                        "Failed to attach track to subscriber"
                    );
                }
            }
        }

        info!(
            room_id = %self.room.id,
            track_id = %track_id,
            kind = %kind,
            attached,
            "Relay track published"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{ConnectionState, TrackKind};
    use crate::testing::{eventually, StubEngine, INVALID_OFFER, VALID_OFFER};
    use crate::types::TrackId;

    fn manager() -> SfuManager<StubEngine> {
        SfuManager::new(StubEngine::new(), SfuConfig::default())
    }

    async fn join(
        manager: &SfuManager<StubEngine>,
        room: &str,
        user: &str,
    ) -> Result<Negotiated> {
        manager
            .handle_offer(
                &RoomId::from(room),
                &UserId::from(user),
                None,
                SessionDescription::offer(VALID_OFFER),
            )
            .await
    }

    #[tokio::test]
    async fn test_first_joiner_publishes_rest_subscribe() {
        let manager = manager();
        let roles: Vec<PeerRole> = {
            let mut roles = Vec::new();
            for user in ["a", "b", "c", "d"] {
                roles.push(join(&manager, "r1", user).await.unwrap().role);
            }
            roles
        };
        assert_eq!(
            roles,
            vec![
                PeerRole::Publisher,
                PeerRole::Subscriber,
                PeerRole::Subscriber,
                PeerRole::Subscriber
            ]
        );
        assert_eq!(manager.room_count(), 1);
    }

    #[tokio::test]
    async fn test_answer_comes_from_session() {
        let manager = manager();
        let negotiated = join(&manager, "r1", "pub").await.unwrap();
        assert_eq!(negotiated.answer, SessionDescription::answer("answer:r1/pub"));
    }

    #[tokio::test]
    async fn test_concurrent_joins_yield_one_publisher() {
        let manager = Arc::new(manager());
        let mut handles = Vec::new();
        for i in 0..8 {
            let manager = Arc::clone(&manager);
            handles.push(tokio::spawn(async move {
                join(&manager, "race", &format!("user{i}")).await.unwrap().role
            }));
        }
        let mut publishers = 0;
        for handle in handles {
            if handle.await.unwrap() == PeerRole::Publisher {
                publishers += 1;
            }
        }
        assert_eq!(publishers, 1);
    }

    #[tokio::test]
    async fn test_explicit_publisher_conflict_rejected() {
        let manager = manager();
        join(&manager, "r1", "pub").await.unwrap();
        let err = manager
            .handle_offer(
                &RoomId::from("r1"),
                &UserId::from("other"),
                Some(PeerRole::Publisher),
                SessionDescription::offer(VALID_OFFER),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SfuError::RoleConflict { publisher, .. } if publisher.as_str() == "pub"));
        // rejected before any session was created
        assert!(manager.engine().session("r1", "other").is_none());
    }

    #[tokio::test]
    async fn test_explicit_subscriber_before_publisher() {
        let manager = manager();
        let negotiated = manager
            .handle_offer(
                &RoomId::from("r1"),
                &UserId::from("early"),
                Some(PeerRole::Subscriber),
                SessionDescription::offer(VALID_OFFER),
            )
            .await
            .unwrap();
        assert_eq!(negotiated.role, PeerRole::Subscriber);

        // the next inferred joiner still becomes publisher
        let negotiated = join(&manager, "r1", "pub").await.unwrap();
        assert_eq!(negotiated.role, PeerRole::Publisher);

        let publisher = manager.engine().session("r1", "pub").unwrap();
        let _feed = publisher.emit_track("video-1", TrackKind::Video).await;
        let early = manager.engine().session("r1", "early").unwrap();
        assert!(eventually(|| early.attached_tracks().len() == 1).await);
    }

    #[tokio::test]
    async fn test_duplicate_identity_rejected() {
        let manager = manager();
        join(&manager, "r1", "pub").await.unwrap();
        join(&manager, "r1", "sub").await.unwrap();
        let err = join(&manager, "r1", "sub").await.unwrap_err();
        assert!(matches!(err, SfuError::PeerExists { role: PeerRole::Subscriber, .. }));
    }

    #[tokio::test]
    async fn test_failed_negotiation_commits_nothing() {
        let manager = manager();
        let err = manager
            .handle_offer(
                &RoomId::from("r1"),
                &UserId::from("pub"),
                None,
                SessionDescription::offer(INVALID_OFFER),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SfuError::Negotiation(_)));
        assert!(!manager.has_room(&RoomId::from("r1")));
        assert_eq!(manager.engine().session("r1", "pub").unwrap().close_count(), 1);

        // the room is usable afterwards and the next joiner still publishes
        assert_eq!(join(&manager, "r1", "pub").await.unwrap().role, PeerRole::Publisher);
    }

    #[tokio::test]
    async fn test_failed_subscriber_keeps_room() {
        let manager = manager();
        join(&manager, "r1", "pub").await.unwrap();
        manager.engine().fail_session_creation("sub");
        assert!(join(&manager, "r1", "sub").await.is_err());
        let snapshot = manager.room_snapshot(&RoomId::from("r1")).await.unwrap();
        assert!(snapshot.subscribers.is_empty());
        assert!(snapshot.publisher.is_some());
    }

    #[tokio::test]
    async fn test_tracks_fan_out_to_existing_subscribers() {
        const K: usize = 4;
        const S: usize = 3;
        let manager = manager();
        join(&manager, "r1", "pub").await.unwrap();
        for i in 0..S {
            join(&manager, "r1", &format!("sub{i}")).await.unwrap();
        }

        let publisher = manager.engine().session("r1", "pub").unwrap();
        let mut feeds = Vec::new();
        for k in 0..K {
            feeds.push(publisher.emit_track(&format!("track{k}"), TrackKind::Video).await);
        }

        let expected: Vec<TrackId> = (0..K).map(|k| TrackId::new(format!("track{k}"))).collect();
        for i in 0..S {
            let sub = manager.engine().session("r1", &format!("sub{i}")).unwrap();
            assert!(eventually(|| sub.attached_tracks().len() == K).await);
            assert_eq!(sub.attached_tracks(), expected);
        }
        // the publisher's own session never gets relay tracks
        assert!(publisher.attached_tracks().is_empty());

        let snapshot = manager.room_snapshot(&RoomId::from("r1")).await.unwrap();
        assert_eq!(snapshot.tracks, expected);
    }

    #[tokio::test]
    async fn test_concurrent_joins_and_tracks_attach_exactly_once() {
        let manager = Arc::new(manager());
        join(&manager, "r1", "pub").await.unwrap();
        let publisher = manager.engine().session("r1", "pub").unwrap();

        let mut joins = Vec::new();
        for i in 0..10 {
            let manager = Arc::clone(&manager);
            joins.push(tokio::spawn(async move {
                join(&manager, "r1", &format!("sub{i}")).await.unwrap();
            }));
        }
        let mut feeds = Vec::new();
        for k in 0..5 {
            feeds.push(publisher.emit_track(&format!("t{k}"), TrackKind::Audio).await);
        }
        for handle in joins {
            handle.await.unwrap();
        }

        for i in 0..10 {
            let sub = manager.engine().session("r1", &format!("sub{i}")).unwrap();
            assert!(eventually(|| sub.attached_tracks().len() >= 5).await);
            let mut attached = sub.attached_tracks();
            attached.sort();
            attached.dedup();
            assert_eq!(attached.len(), 5, "sub{i} saw a duplicate or missed a track");
            assert_eq!(sub.attached_tracks().len(), 5);
        }
    }

    #[tokio::test]
    async fn test_broken_track_is_skipped() {
        let manager = manager();
        join(&manager, "r1", "pub").await.unwrap();
        join(&manager, "r1", "sub").await.unwrap();
        let publisher = manager.engine().session("r1", "pub").unwrap();

        publisher.emit_broken_track("bad", TrackKind::Video).await;
        let _feed = publisher.emit_track("good", TrackKind::Audio).await;

        let sub = manager.engine().session("r1", "sub").unwrap();
        assert!(eventually(|| !sub.attached_tracks().is_empty()).await);
        assert_eq!(sub.attached_tracks(), vec![TrackId::from("good")]);
    }

    #[tokio::test]
    async fn test_packets_are_relayed_and_counted() {
        let manager = manager();
        join(&manager, "r1", "pub").await.unwrap();
        let publisher = manager.engine().session("r1", "pub").unwrap();
        let feed = publisher.emit_track("audio", TrackKind::Audio).await;

        feed.send(bytes::Bytes::from_static(b"rtp-1")).await.unwrap();
        feed.send(bytes::Bytes::from_static(b"rtp-22")).await.unwrap();

        let mut relayed = false;
        for _ in 0..200 {
            if manager.stats().await.packets_relayed == 2 {
                relayed = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert!(relayed);
        let stats = manager.stats().await;
        assert_eq!(stats.bytes_relayed, 11);
        assert_eq!(stats.relay_tracks, 1);
        assert_eq!(stats.publishers, 1);
    }

    #[tokio::test]
    async fn test_ice_candidate_routing() {
        let manager = manager();
        join(&manager, "r1", "pub").await.unwrap();
        join(&manager, "r1", "sub").await.unwrap();

        let candidate = IceCandidate {
            candidate: "candidate:1 1 udp 2122260223 10.0.0.2 50000 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        };
        manager
            .handle_ice_candidate(&RoomId::from("r1"), &UserId::from("sub"), candidate.clone())
            .await
            .unwrap();
        assert_eq!(
            manager.engine().session("r1", "sub").unwrap().candidates(),
            vec![candidate.clone()]
        );
        assert!(manager.engine().session("r1", "pub").unwrap().candidates().is_empty());

        // unknown room and unknown peer are no-ops
        manager
            .handle_ice_candidate(&RoomId::from("nope"), &UserId::from("sub"), candidate.clone())
            .await
            .unwrap();
        manager
            .handle_ice_candidate(&RoomId::from("r1"), &UserId::from("ghost"), candidate)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_malformed_candidate_payload() {
        let manager = manager();
        join(&manager, "r1", "pub").await.unwrap();
        let err = manager
            .handle_ice_candidate_json(
                &RoomId::from("r1"),
                &UserId::from("pub"),
                serde_json::json!({ "sdpMid": "0" }),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SfuError::Decode(_)));

        // unknown peer is still a no-op even with a bad payload
        manager
            .handle_ice_candidate_json(
                &RoomId::from("r1"),
                &UserId::from("ghost"),
                serde_json::json!(42),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_subscriber_leave_keeps_room() {
        let manager = manager();
        join(&manager, "r1", "pub").await.unwrap();
        join(&manager, "r1", "sub").await.unwrap();

        let removed = manager
            .remove_peer(&RoomId::from("r1"), &UserId::from("sub"))
            .await;
        assert_eq!(removed, Some(PeerRole::Subscriber));
        assert!(manager.engine().session("r1", "sub").unwrap().is_closed());
        assert!(!manager.engine().session("r1", "pub").unwrap().is_closed());
        assert!(manager.has_room(&RoomId::from("r1")));
    }

    #[tokio::test]
    async fn test_last_subscriber_leaving_empty_room_removes_it() {
        let manager = manager();
        manager
            .handle_offer(
                &RoomId::from("r1"),
                &UserId::from("watcher"),
                Some(PeerRole::Subscriber),
                SessionDescription::offer(VALID_OFFER),
            )
            .await
            .unwrap();
        manager
            .remove_peer(&RoomId::from("r1"), &UserId::from("watcher"))
            .await;
        assert!(!manager.has_room(&RoomId::from("r1")));
    }

    #[tokio::test]
    async fn test_remove_twice_is_noop() {
        let manager = manager();
        join(&manager, "r1", "pub").await.unwrap();
        join(&manager, "r1", "sub").await.unwrap();

        let room = RoomId::from("r1");
        let sub = UserId::from("sub");
        assert_eq!(manager.remove_peer(&room, &sub).await, Some(PeerRole::Subscriber));
        assert_eq!(manager.remove_peer(&room, &sub).await, None);
        assert_eq!(manager.engine().session("r1", "sub").unwrap().close_count(), 1);

        let publisher = UserId::from("pub");
        assert_eq!(manager.remove_peer(&room, &publisher).await, Some(PeerRole::Publisher));
        assert_eq!(manager.remove_peer(&room, &publisher).await, None);
        assert_eq!(manager.engine().session("r1", "pub").unwrap().close_count(), 1);
    }

    #[tokio::test]
    async fn test_publisher_leave_tears_down_room() {
        let manager = manager();
        join(&manager, "r1", "pub").await.unwrap();
        join(&manager, "r1", "sub1").await.unwrap();

        let publisher = manager.engine().session("r1", "pub").unwrap();
        let feed = publisher.emit_track("audio", TrackKind::Audio).await;
        let sub1 = manager.engine().session("r1", "sub1").unwrap();
        assert!(eventually(|| sub1.attached_tracks().len() == 1).await);

        join(&manager, "r1", "sub2").await.unwrap();
        let sub2 = manager.engine().session("r1", "sub2").unwrap();
        assert_eq!(sub2.attached_tracks(), vec![TrackId::from("audio")]);

        let removed = manager
            .remove_peer(&RoomId::from("r1"), &UserId::from("pub"))
            .await;
        assert_eq!(removed, Some(PeerRole::Publisher));
        assert!(!manager.has_room(&RoomId::from("r1")));
        assert!(publisher.is_closed());
        assert!(sub1.is_closed());
        assert!(sub2.is_closed());

        // the relay task let go of its inbound line
        assert!(eventually(|| feed.is_closed()).await);

        // a new joiner starts a fresh room as publisher
        assert_eq!(join(&manager, "r1", "sub1").await.unwrap().role, PeerRole::Publisher);
    }

    #[tokio::test]
    async fn test_connection_state_is_tracked() {
        let manager = manager();
        join(&manager, "r1", "pub").await.unwrap();
        let publisher = manager.engine().session("r1", "pub").unwrap();
        publisher.emit_state(ConnectionState::Connecting).await;
        publisher.emit_state(ConnectionState::Connected).await;

        let mut connected = false;
        for _ in 0..200 {
            let snapshot = manager.room_snapshot(&RoomId::from("r1")).await.unwrap();
            if snapshot.publisher.map(|p| p.state) == Some(PeerState::Connected) {
                connected = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert!(connected);
    }

    #[tokio::test]
    async fn test_room_limit() {
        let manager = SfuManager::new(
            StubEngine::new(),
            SfuConfig {
                max_rooms: 1,
                ..SfuConfig::default()
            },
        );
        join(&manager, "r1", "a").await.unwrap();
        assert!(matches!(
            join(&manager, "r2", "b").await.unwrap_err(),
            SfuError::RoomLimit(1)
        ));
    }

    #[tokio::test]
    async fn test_subscriber_limit() {
        let manager = SfuManager::new(
            StubEngine::new(),
            SfuConfig {
                max_subscribers_per_room: 1,
                ..SfuConfig::default()
            },
        );
        join(&manager, "r1", "pub").await.unwrap();
        join(&manager, "r1", "sub1").await.unwrap();
        assert!(matches!(
            join(&manager, "r1", "sub2").await.unwrap_err(),
            SfuError::PeerLimit { limit: 1, .. }
        ));
    }

    #[tokio::test]
    async fn test_shutdown_closes_everything() {
        let manager = manager();
        join(&manager, "r1", "pub").await.unwrap();
        join(&manager, "r2", "pub").await.unwrap();
        join(&manager, "r2", "sub").await.unwrap();

        manager.shutdown().await;
        assert_eq!(manager.room_count(), 0);
        assert!(manager.engine().sessions().iter().all(|s| s.is_closed()));
    }
}
