//! Relay track lifecycle
//!
//! Every inbound media line of a publisher gets one relay task that copies raw
//! RTP packets into the matching local relay track. The task stops when:
//! - the owning peer's cancellation token fires (peer removed)
//! - reading from the inbound line fails (session closed, remote gone)
//! - writing to the relay track fails

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::{EngineError, InboundTrack, RelayTrack, TrackKind};
use crate::types::{RoomId, TrackId};

/// A relay track owned by a publisher, with its counters
pub struct PublishedTrack<T> {
    pub track: Arc<T>,
    pub stats: Arc<RelayStats>,
}

impl<T> Clone for PublishedTrack<T> {
    fn clone(&self) -> Self {
        Self {
            track: Arc::clone(&self.track),
            stats: Arc::clone(&self.stats),
        }
    }
}

impl<T: RelayTrack> PublishedTrack<T> {
    pub fn new(track: Arc<T>) -> Self {
        Self {
            track,
            stats: Arc::new(RelayStats::default()),
        }
    }

    #[must_use]
    pub fn id(&self) -> TrackId {
        self.track.id()
    }

    #[must_use]
    pub fn kind(&self) -> TrackKind {
        self.track.kind()
    }
}

/// Relay counters, updated lock-free from the relay task
#[derive(Default)]
pub struct RelayStats {
    packets_relayed: AtomicU64,
    bytes_relayed: AtomicU64,
}

impl RelayStats {
    fn record(&self, size: usize) {
        self.packets_relayed.fetch_add(1, Ordering::Relaxed);
        self.bytes_relayed.fetch_add(size as u64, Ordering::Relaxed);
    }

    #[must_use]
    pub fn packets_relayed(&self) -> u64 {
        self.packets_relayed.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn bytes_relayed(&self) -> u64 {
        self.bytes_relayed.load(Ordering::Relaxed)
    }
}

/// Why a relay task ended
#[derive(Debug)]
pub enum RelayExit {
    Cancelled,
    ReadFailed(EngineError),
    WriteFailed(EngineError),
}

/// Spawn the task copying packets from `inbound` into `relay`
pub fn spawn_relay<I: InboundTrack>(
    room_id: RoomId,
    inbound: I,
    relay: Arc<I::Relay>,
    stats: Arc<RelayStats>,
    cancel: CancellationToken,
) -> JoinHandle<RelayExit> {
    tokio::spawn(async move {
        let track_id = relay.id();
        debug!(room_id = %room_id, track_id = %track_id, "Relay task started");

        let exit = loop {
            let packet = tokio::select! {
                () = cancel.cancelled() => break RelayExit::Cancelled,
                read = inbound.read_packet() => match read {
                    Ok(packet) => packet,
                    Err(e) => break RelayExit::ReadFailed(e),
                },
            };

            if let Err(e) = relay.write_packet(&packet).await {
                break RelayExit::WriteFailed(e);
            }
            stats.record(packet.len());
        };

        match &exit {
            RelayExit::Cancelled => {
                info!(room_id = %room_id, track_id = %track_id, "Relay task cancelled");
            }
            RelayExit::ReadFailed(e) => {
                warn!(room_id = %room_id, track_id = %track_id, error = %e, "Relay read failed, stopping");
            }
            RelayExit::WriteFailed(e) => {
                warn!(room_id = %room_id, track_id = %track_id, error = %e, "Relay write failed, stopping");
            }
        }
        info!(
            room_id = %room_id,
            track_id = %track_id,
            packets = stats.packets_relayed(),
            bytes = stats.bytes_relayed(),
            "Relay task stopped"
        );
        exit
    })
}
