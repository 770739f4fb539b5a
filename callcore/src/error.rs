//! Call-related error types.

use thiserror::Error;

use crate::identity::{IdentityError, UserCode};
use crate::state::InvalidTransition;

#[derive(Debug, Clone, Error)]
pub enum CallError {
    #[error("invalid call state transition: {0}")]
    InvalidTransition(#[from] InvalidTransition),

    #[error("invalid user code: {0}")]
    InvalidIdentity(#[from] IdentityError),

    #[error("no active call")]
    NoActiveCall,

    #[error("cannot call own code {0}")]
    SelfCall(UserCode),

    #[error("no ringing call from {0}")]
    NotRinging(UserCode),

    #[error("negotiation failed: {0}")]
    Negotiation(String),

    #[error("remote description already applied for generation {generation}")]
    RemoteDescriptionAlreadySet { generation: u64 },

    #[error("answer from {from} rejected: {reason}")]
    UnexpectedAnswer { from: UserCode, reason: String },

    #[error("stale candidate: {0}")]
    StaleCandidate(String),

    #[error("transport failed")]
    TransportFailed,

    #[error("data channel unavailable: {0}")]
    DataChannel(String),

    #[error("relay error: {0}")]
    Relay(String),
}
