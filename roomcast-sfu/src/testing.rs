//! Recording stub session engine
//!
//! Records every track attachment, applied candidate and close call so tests
//! can assert on exactly what the SFU asked the engine to do.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::engine::{
    ConnectionState, EngineError, EngineSession, IceCandidate, InboundTrack, MediaSession,
    RelayTrack, SessionDescription, SessionEngine, SessionEvent, TrackKind,
};
use crate::types::{PeerKey, RoomId, TrackId, UserId};

/// Offer SDP accepted by the stub engine
pub const VALID_OFFER: &str = "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=-\r\n";

/// Offer SDP the stub engine refuses to parse
pub const INVALID_OFFER: &str = "invalid sdp";

#[derive(Default)]
pub struct StubEngine {
    sessions: Mutex<Vec<Arc<StubSession>>>,
    failing_users: Mutex<HashSet<UserId>>,
}

impl StubEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `create_session` fail for this user
    pub fn fail_session_creation(&self, user_id: &str) {
        self.failing_users.lock().insert(UserId::from(user_id));
    }

    /// Most recent session created for (room, user)
    #[must_use]
    pub fn session(&self, room_id: &str, user_id: &str) -> Option<Arc<StubSession>> {
        let key = PeerKey::new(RoomId::from(room_id), UserId::from(user_id));
        self.sessions
            .lock()
            .iter()
            .rev()
            .find(|s| s.key == key)
            .cloned()
    }

    #[must_use]
    pub fn sessions(&self) -> Vec<Arc<StubSession>> {
        self.sessions.lock().clone()
    }
}

#[async_trait]
impl SessionEngine for StubEngine {
    type Track = StubRelay;
    type Inbound = StubInbound;
    type Session = StubSession;

    async fn create_session(
        &self,
        key: &PeerKey,
    ) -> Result<EngineSession<StubSession, StubInbound>, EngineError> {
        if self.failing_users.lock().contains(&key.user_id) {
            return Err(EngineError::Setup(format!("refusing session for {key}")));
        }
        let (tx, rx) = mpsc::channel(16);
        let session = Arc::new(StubSession::with_events(key.clone(), Some(tx)));
        self.sessions.lock().push(Arc::clone(&session));
        Ok(EngineSession {
            session,
            events: rx,
        })
    }
}

pub struct StubSession {
    pub key: PeerKey,
    events: Option<mpsc::Sender<SessionEvent<StubInbound>>>,
    remote: Mutex<Option<SessionDescription>>,
    attached: Mutex<Vec<TrackId>>,
    candidates: Mutex<Vec<IceCandidate>>,
    close_count: AtomicUsize,
    closed: CancellationToken,
}

impl StubSession {
    fn with_events(key: PeerKey, events: Option<mpsc::Sender<SessionEvent<StubInbound>>>) -> Self {
        Self {
            key,
            events,
            remote: Mutex::new(None),
            attached: Mutex::new(Vec::new()),
            candidates: Mutex::new(Vec::new()),
            close_count: AtomicUsize::new(0),
            closed: CancellationToken::new(),
        }
    }

    /// Session with no event queue, for tests that build peers by hand
    #[must_use]
    pub fn detached(room_id: &str, user_id: &str) -> Self {
        Self::with_events(PeerKey::new(RoomId::from(room_id), UserId::from(user_id)), None)
    }

    /// Report a new inbound media line; returns the packet feed for it
    pub async fn emit_track(&self, id: &str, kind: TrackKind) -> mpsc::Sender<Bytes> {
        let (inbound, feed) = StubInbound::new(id, kind);
        self.push_inbound(inbound.bound_to(self.closed.clone())).await;
        feed
    }

    /// Report an inbound media line whose relay track cannot be created
    pub async fn emit_broken_track(&self, id: &str, kind: TrackKind) {
        let (mut inbound, _feed) = StubInbound::new(id, kind);
        inbound.fail_relay = true;
        self.push_inbound(inbound).await;
    }

    pub async fn emit_state(&self, state: ConnectionState) {
        if let Some(events) = &self.events {
            let _ = events.send(SessionEvent::ConnectionState(state)).await;
        }
    }

    async fn push_inbound(&self, inbound: StubInbound) {
        if let Some(events) = &self.events {
            let _ = events.send(SessionEvent::Track(inbound)).await;
        }
    }

    #[must_use]
    pub fn attached_tracks(&self) -> Vec<TrackId> {
        self.attached.lock().clone()
    }

    #[must_use]
    pub fn candidates(&self) -> Vec<IceCandidate> {
        self.candidates.lock().clone()
    }

    #[must_use]
    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

#[async_trait]
impl MediaSession for StubSession {
    type Track = StubRelay;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), EngineError> {
        if desc.sdp.trim().is_empty() || desc.sdp.starts_with(INVALID_OFFER) {
            return Err(EngineError::Description("unparseable sdp".to_string()));
        }
        *self.remote.lock() = Some(desc);
        Ok(())
    }

    async fn create_answer(&self) -> Result<SessionDescription, EngineError> {
        if self.remote.lock().is_none() {
            return Err(EngineError::Description("no remote description".to_string()));
        }
        Ok(SessionDescription::answer(format!("answer:{}", self.key)))
    }

    async fn set_local_description(
        &self,
        desc: SessionDescription,
    ) -> Result<SessionDescription, EngineError> {
        Ok(desc)
    }

    async fn add_track(&self, track: Arc<StubRelay>) -> Result<(), EngineError> {
        if self.is_closed() {
            return Err(EngineError::Closed);
        }
        self.attached.lock().push(track.id());
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError> {
        if self.is_closed() {
            return Err(EngineError::Closed);
        }
        if candidate.candidate.starts_with("bogus") {
            return Err(EngineError::Candidate(candidate.candidate));
        }
        self.candidates.lock().push(candidate);
        Ok(())
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.close_count.fetch_add(1, Ordering::SeqCst);
        self.closed.cancel();
        Ok(())
    }
}

pub struct StubInbound {
    id: TrackId,
    kind: TrackKind,
    packets: tokio::sync::Mutex<mpsc::Receiver<Bytes>>,
    session_closed: CancellationToken,
    fail_relay: bool,
}

impl StubInbound {
    #[must_use]
    pub fn new(id: &str, kind: TrackKind) -> (Self, mpsc::Sender<Bytes>) {
        let (tx, rx) = mpsc::channel(64);
        let inbound = Self {
            id: TrackId::from(id),
            kind,
            packets: tokio::sync::Mutex::new(rx),
            session_closed: CancellationToken::new(),
            fail_relay: false,
        };
        (inbound, tx)
    }

    fn bound_to(mut self, session_closed: CancellationToken) -> Self {
        self.session_closed = session_closed;
        self
    }
}

#[async_trait]
impl InboundTrack for StubInbound {
    type Relay = StubRelay;

    fn id(&self) -> TrackId {
        self.id.clone()
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn create_relay(&self) -> Result<Arc<StubRelay>, EngineError> {
        if self.fail_relay {
            return Err(EngineError::Track(format!("unsupported codec on {}", self.id)));
        }
        Ok(Arc::new(StubRelay::new(self.id.as_str(), self.kind)))
    }

    async fn read_packet(&self) -> Result<Bytes, EngineError> {
        let mut packets = self.packets.lock().await;
        tokio::select! {
            () = self.session_closed.cancelled() => Err(EngineError::Closed),
            packet = packets.recv() => packet.ok_or_else(|| EngineError::Io("inbound ended".to_string())),
        }
    }
}

pub struct StubRelay {
    id: TrackId,
    kind: TrackKind,
    written: Mutex<Vec<Vec<u8>>>,
    fail_writes: bool,
}

impl StubRelay {
    #[must_use]
    pub fn new(id: &str, kind: TrackKind) -> Self {
        Self {
            id: TrackId::from(id),
            kind,
            written: Mutex::new(Vec::new()),
            fail_writes: false,
        }
    }

    #[must_use]
    pub fn failing(id: &str, kind: TrackKind) -> Self {
        Self {
            fail_writes: true,
            ..Self::new(id, kind)
        }
    }

    #[must_use]
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.written.lock().clone()
    }
}

#[async_trait]
impl RelayTrack for StubRelay {
    fn id(&self) -> TrackId {
        self.id.clone()
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    async fn write_packet(&self, packet: &[u8]) -> Result<(), EngineError> {
        if self.fail_writes {
            return Err(EngineError::Io("closed pipe".to_string()));
        }
        self.written.lock().push(packet.to_vec());
        Ok(())
    }
}

/// Poll `condition` until it holds or a second passes
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
