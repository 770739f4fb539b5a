use callcore::CallError;
use thiserror::Error;

use crate::signaling::SignalingError;

/// Everything a handler can report, either as a command result or on the
/// `error` event channel.
#[derive(Debug, Clone, Error)]
pub enum HandlerError {
    #[error(transparent)]
    Signaling(#[from] SignalingError),

    #[error(transparent)]
    Call(#[from] CallError),

    #[error("call handler has shut down")]
    Closed,
}

impl HandlerError {
    pub fn is_unreachable(&self) -> bool {
        matches!(self, Self::Signaling(SignalingError::Unreachable { .. }))
    }
}

pub type Result<T, E = HandlerError> = std::result::Result<T, E>;
