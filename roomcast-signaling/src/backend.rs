//! Seam between the signaling layer and the SFU

use async_trait::async_trait;
use roomcast_sfu::{PeerRole, RoomId, SessionDescription, SessionEngine, SfuManager, UserId};
use tracing::debug;

use crate::error::Result;

/// Session operations the signaling layer needs
#[async_trait]
pub trait SignalingBackend: Send + Sync + 'static {
    async fn handle_offer(
        &self,
        room_id: &RoomId,
        user_id: &UserId,
        role: Option<PeerRole>,
        offer: SessionDescription,
    ) -> Result<SessionDescription>;

    /// Apply a raw `ice_candidate` payload
    async fn handle_ice_candidate(
        &self,
        room_id: &RoomId,
        user_id: &UserId,
        payload: serde_json::Value,
    ) -> Result<()>;

    /// Drop whatever session `user_id` holds in `room_id`, returning the role
    /// it held. Releasing a publisher tears down the whole room.
    async fn release_session(&self, room_id: &RoomId, user_id: &UserId) -> Option<PeerRole>;
}

#[async_trait]
impl<E: SessionEngine> SignalingBackend for SfuManager<E> {
    async fn handle_offer(
        &self,
        room_id: &RoomId,
        user_id: &UserId,
        role: Option<PeerRole>,
        offer: SessionDescription,
    ) -> Result<SessionDescription> {
        let negotiated = SfuManager::handle_offer(self, room_id, user_id, role, offer).await?;
        Ok(negotiated.answer)
    }

    async fn handle_ice_candidate(
        &self,
        room_id: &RoomId,
        user_id: &UserId,
        payload: serde_json::Value,
    ) -> Result<()> {
        self.handle_ice_candidate_json(room_id, user_id, payload)
            .await?;
        Ok(())
    }

    async fn release_session(&self, room_id: &RoomId, user_id: &UserId) -> Option<PeerRole> {
        let role = self.remove_peer(room_id, user_id).await;
        if let Some(role) = role {
            debug!(room_id = %room_id, user_id = %user_id, role = %role, "Released SFU session");
        }
        role
    }
}
