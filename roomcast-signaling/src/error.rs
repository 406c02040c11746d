//! Signaling error types

use roomcast_sfu::SfuError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error(transparent)]
    Backend(#[from] SfuError),

    #[error("hub is not running")]
    HubClosed,
}

pub type Result<T> = std::result::Result<T, SignalingError>;
