//! Control channel to the signaling relay.

mod connection;
mod error;

pub use connection::{Dialed, SignalingConnection, SignalingEvent, SignalingState};
pub use error::SignalingError;
