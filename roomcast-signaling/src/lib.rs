//! Roomcast signaling
//!
//! WebSocket signaling in front of the SFU:
//!
//! - **`Hub`**: single-task connection registry (membership, broadcast)
//! - **`Client`**: per-connection read/write pumps and message dispatch
//! - **`SignalingBackend`**: the session operations the hub and clients call,
//!   implemented for `roomcast_sfu::SfuManager`
//! - **`http`**: axum router with the `/ws` entry point and `/health`

pub mod backend;
pub mod client;
pub mod config;
pub mod error;
pub mod http;
pub mod hub;
pub mod message;


pub use backend::SignalingBackend;
pub use client::Client;
pub use config::SignalingConfig;
pub use error::{Result, SignalingError};
pub use http::{create_router, AppState};
pub use hub::{ClientHandle, ConnectionId, Hub, HubHandle};
pub use message::{MessageKind, SdpPayload, SignalMessage, SFU_USER_ID};
