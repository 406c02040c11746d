//! WebSocket signaling entry point
//!
//! `GET /ws?room_id=..&user_id=..` upgrades to a signaling connection bound to
//! that identity pair for its whole lifetime.

use axum::{
    extract::{FromRequestParts, Query, State, WebSocketUpgrade},
    http::request::Parts,
    response::IntoResponse,
};
use roomcast_sfu::{RoomId, UserId};
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;

use crate::client::Client;
use crate::http::{AppError, AppState};
use crate::hub::ClientHandle;

/// Query parameters for WebSocket connection
#[derive(Debug, Default, Deserialize)]
pub struct WsQuery {
    pub room_id: Option<String>,
    pub user_id: Option<String>,
}

/// Validated identity of a connection request
#[derive(Debug, Clone)]
pub struct ConnectionIdentity {
    pub room_id: RoomId,
    pub user_id: UserId,
}

impl TryFrom<WsQuery> for ConnectionIdentity {
    type Error = AppError;

    fn try_from(query: WsQuery) -> Result<Self, Self::Error> {
        let room_id = RoomId::from(query.room_id.unwrap_or_default());
        let user_id = UserId::from(query.user_id.unwrap_or_default());
        if room_id.is_empty() || user_id.is_empty() {
            return Err(AppError::bad_request("room_id and user_id are required"));
        }
        Ok(Self { room_id, user_id })
    }
}

impl<S: Send + Sync> FromRequestParts<S> for ConnectionIdentity {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Query(query) = Query::<WsQuery>::from_request_parts(parts, state)
            .await
            .map_err(|e| AppError::bad_request(e.body_text()))?;
        Self::try_from(query)
    }
}

/// Identity is validated before the upgrade so a rejected request never
/// touches hub or SFU state.
pub async fn websocket_handler(
    State(state): State<AppState>,
    identity: ConnectionIdentity,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let ConnectionIdentity { room_id, user_id } = identity;
    info!(room_id = %room_id, user_id = %user_id, "WebSocket connection requested");

    ws.max_message_size(state.config.max_message_size)
        .on_upgrade(move |socket| async move {
            let (handle, outbound) =
                ClientHandle::new(room_id, user_id, state.config.outbound_queue_capacity);
            info!(
                room_id = %handle.room_id,
                user_id = %handle.user_id,
                connection_id = handle.connection_id,
                "WebSocket connection established"
            );
            let client = Client::new(
                handle,
                state.hub.clone(),
                Arc::clone(&state.backend),
                Arc::clone(&state.config),
            );
            client.serve(socket, outbound).await;
        })
}
