//! SFU Room management

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::{Mutex, MutexGuard};

use crate::engine::MediaSession;
use crate::peer::{Peer, PeerInfo, PeerRole};
use crate::types::{RoomId, TrackId, UserId};

/// One room: at most one publisher plus subscribers keyed by user id.
///
/// All publisher/subscriber/track mutation happens under `state`. The lock is
/// async because negotiation and track attachment run while it is held.
pub struct SfuRoom<S: MediaSession> {
    pub id: RoomId,
    pub created_at: DateTime<Utc>,
    state: Mutex<RoomState<S>>,
}

impl<S: MediaSession> SfuRoom<S> {
    #[must_use]
    pub fn new(id: RoomId) -> Self {
        Self {
            id,
            created_at: Utc::now(),
            state: Mutex::new(RoomState::default()),
        }
    }

    pub async fn lock(&self) -> MutexGuard<'_, RoomState<S>> {
        self.state.lock().await
    }

    pub async fn snapshot(&self) -> RoomSnapshot {
        let state = self.state.lock().await;
        state.snapshot(&self.id)
    }

    pub async fn get_stats(&self) -> RoomStats {
        let state = self.state.lock().await;
        state.stats()
    }
}

pub struct RoomState<S: MediaSession> {
    pub publisher: Option<Peer<S>>,
    pub subscribers: HashMap<UserId, Peer<S>>,
    /// Set once the room has been torn down and unlinked from the registry
    closed: bool,
}

impl<S: MediaSession> Default for RoomState<S> {
    fn default() -> Self {
        Self {
            publisher: None,
            subscribers: HashMap::new(),
            closed: false,
        }
    }
}

impl<S: MediaSession> RoomState<S> {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.publisher.is_none() && self.subscribers.is_empty()
    }

    #[must_use]
    pub const fn is_closed(&self) -> bool {
        self.closed
    }

    pub(crate) fn mark_closed(&mut self) {
        self.closed = true;
    }

    #[must_use]
    pub fn publisher_id(&self) -> Option<&UserId> {
        self.publisher.as_ref().map(|p| &p.user_id)
    }

    /// Role currently held by `user_id`, if any
    #[must_use]
    pub fn role_of(&self, user_id: &UserId) -> Option<PeerRole> {
        if self.publisher_id() == Some(user_id) {
            Some(PeerRole::Publisher)
        } else if self.subscribers.contains_key(user_id) {
            Some(PeerRole::Subscriber)
        } else {
            None
        }
    }

    #[must_use]
    pub fn find(&self, user_id: &UserId) -> Option<&Peer<S>> {
        match &self.publisher {
            Some(publisher) if &publisher.user_id == user_id => Some(publisher),
            _ => self.subscribers.get(user_id),
        }
    }

    #[must_use]
    pub fn snapshot(&self, room_id: &RoomId) -> RoomSnapshot {
        let mut subscribers: Vec<PeerInfo> = self.subscribers.values().map(Peer::info).collect();
        subscribers.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        let publisher = self.publisher.as_ref().map(Peer::info);
        let tracks = publisher
            .as_ref()
            .map(|p| p.tracks.clone())
            .unwrap_or_default();
        RoomSnapshot {
            room_id: room_id.clone(),
            publisher,
            subscribers,
            tracks,
        }
    }

    #[must_use]
    pub fn stats(&self) -> RoomStats {
        let mut stats = RoomStats {
            has_publisher: self.publisher.is_some(),
            subscriber_count: self.subscribers.len(),
            ..Default::default()
        };
        if let Some(publisher) = &self.publisher {
            for track in publisher.tracks() {
                stats.track_count += 1;
                stats.packets_relayed += track.stats.packets_relayed();
                stats.bytes_relayed += track.stats.bytes_relayed();
            }
        }
        stats
    }
}

/// Read-only view of a room
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomSnapshot {
    pub room_id: RoomId,
    pub publisher: Option<PeerInfo>,
    pub subscribers: Vec<PeerInfo>,
    pub tracks: Vec<TrackId>,
}

impl RoomSnapshot {
    #[must_use]
    pub fn subscriber_ids(&self) -> Vec<UserId> {
        self.subscribers.iter().map(|s| s.user_id.clone()).collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RoomStats {
    pub has_publisher: bool,
    pub subscriber_count: usize,
    pub track_count: usize,
    pub packets_relayed: u64,
    pub bytes_relayed: u64,
}
