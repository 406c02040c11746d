//! SFU Peer management
//!
//! A peer wraps one media session with its identity and role. Publishers also
//! own the ordered list of relay tracks produced from their inbound media
//! lines. Each peer owns a cancellation token that scopes its coordinator and
//! relay tasks.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::engine::{ConnectionState, MediaSession};
use crate::track::PublishedTrack;
use crate::types::{RoomId, TrackId, UserId};

/// Role of a peer within its room
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerRole {
    Publisher,
    Subscriber,
}

impl fmt::Display for PeerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Publisher => f.write_str("publisher"),
            Self::Subscriber => f.write_str("subscriber"),
        }
    }
}

/// Observed lifecycle of a peer: `Negotiating -> Connected -> Closed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerState {
    Negotiating,
    Connected,
    Closed,
}

impl PeerState {
    /// Next state after an engine connectivity notification. `Closed` is terminal.
    #[must_use]
    pub const fn on_connection_state(self, state: ConnectionState) -> Self {
        match (self, state) {
            (Self::Closed, _) | (_, ConnectionState::Failed | ConnectionState::Closed) => {
                Self::Closed
            }
            (_, ConnectionState::Connected) => Self::Connected,
            (current, _) => current,
        }
    }
}

pub struct Peer<S: MediaSession> {
    pub user_id: UserId,
    pub room_id: RoomId,
    pub role: PeerRole,
    pub joined_at: DateTime<Utc>,
    session: Arc<S>,
    tracks: Vec<PublishedTrack<S::Track>>,
    cancel: CancellationToken,
    state: Arc<RwLock<PeerState>>,
    closed: AtomicBool,
}

impl<S: MediaSession> Peer<S> {
    pub fn new(room_id: RoomId, user_id: UserId, role: PeerRole, session: Arc<S>) -> Self {
        Self {
            user_id,
            room_id,
            role,
            joined_at: Utc::now(),
            session,
            tracks: Vec::new(),
            cancel: CancellationToken::new(),
            state: Arc::new(RwLock::new(PeerState::Negotiating)),
            closed: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn session(&self) -> &Arc<S> {
        &self.session
    }

    #[must_use]
    pub fn tracks(&self) -> &[PublishedTrack<S::Track>] {
        &self.tracks
    }

    pub(crate) fn push_track(&mut self, track: PublishedTrack<S::Track>) {
        self.tracks.push(track);
    }

    #[must_use]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    #[must_use]
    pub fn state(&self) -> PeerState {
        *self.state.read()
    }

    pub(crate) fn state_handle(&self) -> Arc<RwLock<PeerState>> {
        Arc::clone(&self.state)
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state() == PeerState::Closed || self.closed.load(Ordering::Acquire)
    }

    /// Cancel the peer's tasks, then close its session. Only the first call
    /// reaches the engine.
    pub async fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            debug!(room_id = %self.room_id, user_id = %self.user_id, "Peer already closed");
            return false;
        }
        *self.state.write() = PeerState::Closed;
        self.cancel.cancel();
        if let Err(e) = self.session.close().await {
            warn!(
                room_id = %self.room_id,
                user_id = %self.user_id,
                error = %e,
                "Failed to close session"
            );
        }
        debug!(room_id = %self.room_id, user_id = %self.user_id, role = %self.role, "Peer closed");
        true
    }

    #[must_use]
    pub fn info(&self) -> PeerInfo {
        PeerInfo {
            user_id: self.user_id.clone(),
            role: self.role,
            state: self.state(),
            joined_at: self.joined_at,
            tracks: self.tracks.iter().map(PublishedTrack::id).collect(),
        }
    }
}

/// Read-only view of a peer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerInfo {
    pub user_id: UserId,
    pub role: PeerRole,
    pub state: PeerState,
    pub joined_at: DateTime<Utc>,
    pub tracks: Vec<TrackId>,
}
