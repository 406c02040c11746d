//! Signaling message schema
//!
//! One JSON object per WebSocket text frame:
//! `{ "type", "room_id", "user_id", "payload" }`.

use roomcast_sfu::{PeerRole, RoomId, SdpType, SessionDescription, UserId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity the SFU signs its replies with
pub const SFU_USER_ID: &str = "sfu";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Offer,
    Answer,
    IceCandidate,
    Join,
    Leave,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::IceCandidate => "ice_candidate",
            Self::Join => "join",
            Self::Leave => "leave",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalMessage {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default)]
    pub room_id: RoomId,
    #[serde(default)]
    pub user_id: UserId,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl SignalMessage {
    /// Answer produced by the SFU for `room_id`
    #[must_use]
    pub fn answer(room_id: RoomId, answer: SessionDescription) -> Self {
        let payload = SdpPayload {
            sdp: answer.sdp,
            sdp_type: answer.sdp_type,
            role: None,
        };
        Self {
            kind: MessageKind::Answer,
            room_id,
            user_id: UserId::from(SFU_USER_ID),
            payload: serde_json::to_value(payload).unwrap_or_default(),
        }
    }

    pub fn sdp_payload(&self) -> serde_json::Result<SdpPayload> {
        serde_json::from_value(self.payload.clone())
    }
}

/// Payload of `offer` and `answer` messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SdpPayload {
    pub sdp: String,
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    /// Role claimed by the sender of an offer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<PeerRole>,
}

impl SdpPayload {
    #[must_use]
    pub fn description(&self) -> SessionDescription {
        SessionDescription {
            sdp_type: self.sdp_type,
            sdp: self.sdp.clone(),
        }
    }
}
