// Module: http
// WebSocket signaling endpoint and health probe

pub mod error;
pub mod health;
pub mod websocket;

use axum::{routing::get, Router};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::backend::SignalingBackend;
use crate::config::SignalingConfig;
use crate::hub::HubHandle;

pub use error::AppError;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub hub: HubHandle,
    pub backend: Arc<dyn SignalingBackend>,
    pub config: Arc<SignalingConfig>,
}

/// Create the HTTP router with all routes
pub fn create_router(state: AppState) -> Router {
    let router = Router::new()
        .route("/ws", get(websocket::websocket_handler))
        .merge(health::create_health_router());

    // Apply layers before state
    let router = router
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http());

    router.with_state(state)
}
