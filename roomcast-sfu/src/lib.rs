//! Roomcast SFU (Selective Forwarding Unit)
//!
//! One publisher per room, any number of subscribers. Every media line the
//! publisher sends is mirrored into a local relay track that is attached to
//! each subscriber's session, so subscribers receive the publisher's media
//! without the publisher uploading more than once.
//!
//! ## Architecture
//!
//! - **`SfuManager`**: room registry, role assignment, negotiation, teardown
//! - **`SfuRoom`**: one room's publisher, subscribers and relay tracks
//! - **`Peer`**: one participant's session, role and lifecycle
//! - **`PublishedTrack`**: a relay track plus its forwarding task and counters
//! - **`SessionEngine`**: the seam to the media stack ([`WebRtcEngine`] in
//!   production)
//!
//! ## Usage
//!
//! ```rust,ignore
//! use roomcast_sfu::{SfuConfig, SfuManager, WebRtcEngine, SessionDescription};
//!
//! let config = SfuConfig::default();
//! let manager = SfuManager::new(WebRtcEngine::new(&config)?, config);
//! let negotiated = manager
//!     .handle_offer(&"room".into(), &"alice".into(), None, SessionDescription::offer(sdp))
//!     .await?;
//! ```

mod config;
mod engine;
mod error;
mod manager;
mod peer;
mod room;
mod track;
mod types;
mod webrtc_engine;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use config::SfuConfig;
pub use engine::{
    negotiate, ConnectionState, EngineError, EngineSession, IceCandidate, InboundTrack,
    MediaSession, RelayTrack, SdpType, SessionDescription, SessionEngine, SessionEvent, TrackKind,
};
pub use error::{Result, SfuError};
pub use manager::{ManagerStats, Negotiated, SfuManager};
pub use peer::{Peer, PeerInfo, PeerRole, PeerState};
pub use room::{RoomSnapshot, RoomState, RoomStats, SfuRoom};
pub use track::{spawn_relay, PublishedTrack, RelayExit, RelayStats};
pub use types::{PeerKey, RoomId, TrackId, UserId};
pub use webrtc_engine::{WebRtcEngine, WebRtcInbound, WebRtcRelay, WebRtcSession};
