//! Session engine backed by the `webrtc` crate

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};
use webrtc::track::track_remote::TrackRemote;
use webrtc::util::marshal::Marshal;

use crate::config::SfuConfig;
use crate::engine::{
    ConnectionState, EngineError, EngineSession, IceCandidate, InboundTrack, MediaSession,
    RelayTrack, SdpType, SessionDescription, SessionEngine, SessionEvent, TrackKind,
};
use crate::types::{PeerKey, TrackId};

impl From<RTPCodecType> for TrackKind {
    fn from(codec_type: RTPCodecType) -> Self {
        match codec_type {
            RTPCodecType::Audio => Self::Audio,
            _ => Self::Video,
        }
    }
}

impl From<RTCPeerConnectionState> for ConnectionState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Connecting => Self::Connecting,
            RTCPeerConnectionState::Connected => Self::Connected,
            RTCPeerConnectionState::Disconnected => Self::Disconnected,
            RTCPeerConnectionState::Failed => Self::Failed,
            RTCPeerConnectionState::Closed => Self::Closed,
            _ => Self::New,
        }
    }
}

/// Media engine with default codecs and interceptors
pub struct WebRtcEngine {
    api: API,
    ice_servers: Vec<RTCIceServer>,
    event_queue_capacity: usize,
    relay_buffer_size: usize,
    gather_timeout: Duration,
}

impl WebRtcEngine {
    pub fn new(config: &SfuConfig) -> Result<Self, EngineError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| EngineError::Setup(e.to_string()))?;

        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| EngineError::Setup(e.to_string()))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = if config.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: config.ice_servers.clone(),
                ..Default::default()
            }]
        };

        Ok(Self {
            api,
            ice_servers,
            event_queue_capacity: config.event_queue_capacity.max(1),
            relay_buffer_size: config.relay_buffer_size.max(1),
            gather_timeout: config.gather_timeout(),
        })
    }
}

#[async_trait]
impl SessionEngine for WebRtcEngine {
    type Track = WebRtcRelay;
    type Inbound = WebRtcInbound;
    type Session = WebRtcSession;

    async fn create_session(
        &self,
        key: &PeerKey,
    ) -> Result<EngineSession<WebRtcSession, WebRtcInbound>, EngineError> {
        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };
        let pc = Arc::new(
            self.api
                .new_peer_connection(config)
                .await
                .map_err(|e| EngineError::Setup(e.to_string()))?,
        );

        let (events_tx, events) = mpsc::channel(self.event_queue_capacity);

        let track_events = events_tx.clone();
        let buffer_size = self.relay_buffer_size;
        let track_key = key.clone();
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let events = track_events.clone();
                let key = track_key.clone();
                Box::pin(async move {
                    debug!(peer = %key, track_id = %track.id(), kind = %track.kind(), "Remote track received");
                    let inbound = WebRtcInbound::new(track, buffer_size);
                    if events.send(SessionEvent::Track(inbound)).await.is_err() {
                        debug!(peer = %key, "Session events dropped, ignoring track");
                    }
                })
            },
        ));

        let state_key = key.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let events = events_tx.clone();
            let key = state_key.clone();
            Box::pin(async move {
                debug!(peer = %key, state = %state, "Peer connection state changed");
                let _ = events.send(SessionEvent::ConnectionState(state.into())).await;
            })
        }));

        Ok(EngineSession {
            session: Arc::new(WebRtcSession {
                key: key.clone(),
                pc,
                gather_timeout: self.gather_timeout,
            }),
            events,
        })
    }
}

pub struct WebRtcSession {
    key: PeerKey,
    pc: Arc<RTCPeerConnection>,
    gather_timeout: Duration,
}

#[async_trait]
impl MediaSession for WebRtcSession {
    type Track = WebRtcRelay;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), EngineError> {
        let remote = match desc.sdp_type {
            SdpType::Offer => RTCSessionDescription::offer(desc.sdp),
            SdpType::Answer => RTCSessionDescription::answer(desc.sdp),
        }
        .map_err(|e| EngineError::Description(e.to_string()))?;

        self.pc
            .set_remote_description(remote)
            .await
            .map_err(|e| EngineError::Description(e.to_string()))
    }

    async fn create_answer(&self) -> Result<SessionDescription, EngineError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| EngineError::Description(e.to_string()))?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    /// Apply the answer and wait (bounded) for candidate gathering so the
    /// returned SDP already carries the local candidates.
    async fn set_local_description(
        &self,
        desc: SessionDescription,
    ) -> Result<SessionDescription, EngineError> {
        let local = match desc.sdp_type {
            SdpType::Answer => RTCSessionDescription::answer(desc.sdp),
            SdpType::Offer => RTCSessionDescription::offer(desc.sdp),
        }
        .map_err(|e| EngineError::Description(e.to_string()))?;

        let mut gathered = self.pc.gathering_complete_promise().await;
        self.pc
            .set_local_description(local)
            .await
            .map_err(|e| EngineError::Description(e.to_string()))?;

        if tokio::time::timeout(self.gather_timeout, gathered.recv())
            .await
            .is_err()
        {
            warn!(
                peer = %self.key,
                timeout_ms = self.gather_timeout.as_millis() as u64,
                "Candidate gathering timed out, answering with partial candidates"
            );
        }

        let final_desc = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| EngineError::Description("no local description".to_string()))?;
        Ok(SessionDescription {
            sdp_type: desc.sdp_type,
            sdp: final_desc.sdp,
        })
    }

    async fn add_track(&self, track: Arc<WebRtcRelay>) -> Result<(), EngineError> {
        let local: Arc<dyn TrackLocal + Send + Sync> = Arc::clone(&track.track) as _;
        let sender = self
            .pc
            .add_track(local)
            .await
            .map_err(|e| EngineError::Track(e.to_string()))?;

        // Drain RTCP so interceptors keep running
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        });
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: None,
            })
            .await
            .map_err(|e| EngineError::Candidate(e.to_string()))
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.pc
            .close()
            .await
            .map_err(|e| EngineError::Io(e.to_string()))
    }
}

/// Inbound media line of a publisher
pub struct WebRtcInbound {
    track: Arc<TrackRemote>,
    buf: Mutex<Vec<u8>>,
}

impl WebRtcInbound {
    fn new(track: Arc<TrackRemote>, buffer_size: usize) -> Self {
        Self {
            track,
            buf: Mutex::new(vec![0u8; buffer_size]),
        }
    }
}

#[async_trait]
impl InboundTrack for WebRtcInbound {
    type Relay = WebRtcRelay;

    fn id(&self) -> TrackId {
        TrackId::new(self.track.id())
    }

    fn kind(&self) -> TrackKind {
        self.track.kind().into()
    }

    fn create_relay(&self) -> Result<Arc<WebRtcRelay>, EngineError> {
        let codec = self.track.codec();
        if codec.capability.mime_type.is_empty() {
            return Err(EngineError::Track(format!(
                "no negotiated codec for track {}",
                self.track.id()
            )));
        }
        let local = TrackLocalStaticRTP::new(
            codec.capability,
            self.track.id(),
            self.track.stream_id(),
        );
        Ok(Arc::new(WebRtcRelay {
            track: Arc::new(local),
            kind: self.kind(),
        }))
    }

    async fn read_packet(&self) -> Result<Bytes, EngineError> {
        let mut buf = self.buf.lock().await;
        let (packet, _attributes) = self
            .track
            .read(&mut buf)
            .await
            .map_err(|e| EngineError::Io(e.to_string()))?;
        packet.marshal().map_err(|e| EngineError::Io(e.to_string()))
    }
}

/// Local relay track fanned out to subscriber sessions
pub struct WebRtcRelay {
    track: Arc<TrackLocalStaticRTP>,
    kind: TrackKind,
}

#[async_trait]
impl RelayTrack for WebRtcRelay {
    fn id(&self) -> TrackId {
        TrackId::new(self.track.id())
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    async fn write_packet(&self, packet: &[u8]) -> Result<(), EngineError> {
        self.track
            .write(packet)
            .await
            .map(|_| ())
            .map_err(|e| EngineError::Io(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_mapping() {
        assert_eq!(
            ConnectionState::from(RTCPeerConnectionState::Connected),
            ConnectionState::Connected
        );
        assert_eq!(
            ConnectionState::from(RTCPeerConnectionState::Failed),
            ConnectionState::Failed
        );
        assert_eq!(
            ConnectionState::from(RTCPeerConnectionState::Unspecified),
            ConnectionState::New
        );
    }

    #[test]
    fn test_codec_type_mapping() {
        assert_eq!(TrackKind::from(RTPCodecType::Audio), TrackKind::Audio);
        assert_eq!(TrackKind::from(RTPCodecType::Video), TrackKind::Video);
    }

    #[test]
    fn test_engine_builds_with_defaults() {
        assert!(WebRtcEngine::new(&SfuConfig::default()).is_ok());
    }

    #[tokio::test]
    async fn test_session_rejects_garbage_offer() {
        let engine = WebRtcEngine::new(&SfuConfig {
            ice_servers: Vec::new(),
            ..SfuConfig::default()
        })
        .unwrap();
        let key = PeerKey::new("r1".into(), "u1".into());
        let EngineSession { session, .. } = engine.create_session(&key).await.unwrap();
        let err = session
            .set_remote_description(SessionDescription::offer("not sdp"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Description(_)));
        session.close().await.unwrap();
    }
}
