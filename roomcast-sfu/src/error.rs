//! SFU error types

use thiserror::Error;

use crate::engine::EngineError;
use crate::peer::PeerRole;
use crate::types::{RoomId, UserId};

#[derive(Debug, Error)]
pub enum SfuError {
    /// Session creation or offer/answer exchange failed
    #[error("negotiation failed: {0}")]
    Negotiation(EngineError),

    #[error("session engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("room {room_id} already has publisher {publisher}")]
    RoleConflict { room_id: RoomId, publisher: UserId },

    #[error("{user_id} already joined room {room_id} as {role}")]
    PeerExists {
        room_id: RoomId,
        user_id: UserId,
        role: PeerRole,
    },

    #[error("maximum number of rooms reached ({0})")]
    RoomLimit(usize),

    #[error("room {room_id} is full ({limit} subscribers)")]
    PeerLimit { room_id: RoomId, limit: usize },

    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SfuError>;
