//! Session engine seam
//!
//! The SFU never talks to a media stack directly. Everything it needs from one
//! (negotiation, track attachment, candidate application, packet I/O) goes
//! through the traits in this module. [`crate::WebRtcEngine`] implements them on
//! top of the `webrtc` crate; tests use the recording stub in `testing`.
//!
//! Engine notifications (inbound tracks, connectivity changes) are delivered as
//! [`SessionEvent`]s on a bounded queue returned from
//! [`SessionEngine::create_session`]. One coordinator task per peer drains it.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::types::{PeerKey, TrackId};

/// Failure reported by a session engine
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("session setup failed: {0}")]
    Setup(String),

    #[error("invalid session description: {0}")]
    Description(String),

    #[error("track error: {0}")]
    Track(String),

    #[error("candidate rejected: {0}")]
    Candidate(String),

    #[error("packet i/o failed: {0}")]
    Io(String),

    #[error("session closed")]
    Closed,
}

/// Session description kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

impl fmt::Display for SdpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Offer => f.write_str("offer"),
            Self::Answer => f.write_str("answer"),
        }
    }
}

/// An offer or answer blob
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Connectivity candidate as exchanged with browsers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
}

/// Media kind of a track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Audio => f.write_str("audio"),
            Self::Video => f.write_str("video"),
        }
    }
}

/// Connectivity state as reported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Notification pushed by an engine session
#[derive(Debug)]
pub enum SessionEvent<I> {
    /// The remote side started sending a media line
    Track(I),
    ConnectionState(ConnectionState),
}

/// A freshly created session together with its event queue
pub struct EngineSession<S, I> {
    pub session: Arc<S>,
    pub events: mpsc::Receiver<SessionEvent<I>>,
}

/// Locally produced track that mirrors one inbound media line
#[async_trait]
pub trait RelayTrack: Send + Sync + 'static {
    fn id(&self) -> TrackId;

    fn kind(&self) -> TrackKind;

    /// Write one raw RTP packet to every session this track is attached to
    async fn write_packet(&self, packet: &[u8]) -> Result<(), EngineError>;
}

/// Media line received from a remote publisher
#[async_trait]
pub trait InboundTrack: Send + Sync + 'static {
    type Relay: RelayTrack;

    fn id(&self) -> TrackId;

    fn kind(&self) -> TrackKind;

    /// Build a local track with the same codec parameters
    fn create_relay(&self) -> Result<Arc<Self::Relay>, EngineError>;

    /// Block until the next raw RTP packet arrives. Must fail promptly once the
    /// owning session is closed.
    async fn read_packet(&self) -> Result<Bytes, EngineError>;
}

/// One negotiated media session
#[async_trait]
pub trait MediaSession: Send + Sync + 'static {
    type Track: RelayTrack;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), EngineError>;

    async fn create_answer(&self) -> Result<SessionDescription, EngineError>;

    /// Apply the local description and return the final form to send back
    async fn set_local_description(
        &self,
        desc: SessionDescription,
    ) -> Result<SessionDescription, EngineError>;

    async fn add_track(&self, track: Arc<Self::Track>) -> Result<(), EngineError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError>;

    async fn close(&self) -> Result<(), EngineError>;
}

/// Factory for media sessions
#[async_trait]
pub trait SessionEngine: Send + Sync + 'static {
    type Track: RelayTrack;
    type Inbound: InboundTrack<Relay = Self::Track>;
    type Session: MediaSession<Track = Self::Track>;

    async fn create_session(
        &self,
        key: &PeerKey,
    ) -> Result<EngineSession<Self::Session, Self::Inbound>, EngineError>;
}

/// Run the offer/answer exchange on a session
pub async fn negotiate<S: MediaSession + ?Sized>(
    session: &S,
    offer: SessionDescription,
) -> Result<SessionDescription, EngineError> {
    if offer.sdp_type != SdpType::Offer {
        return Err(EngineError::Description(format!(
            "expected an offer, got {}",
            offer.sdp_type
        )));
    }
    session.set_remote_description(offer).await?;
    let answer = session.create_answer().await?;
    session.set_local_description(answer).await
}
