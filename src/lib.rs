//! Call signaling and connection lifecycle for peer-to-peer calls between
//! endpoints identified by short user codes.
//!
//! The protocol types live in `callcore`; this crate adds the I/O: the
//! control channel to the relay, transport sessions on top of `webrtc`, and
//! the handler task that ties them together.

pub use callcore::{
    CallError, CallRole, CallSession, CallState, EndReason, IceCandidate, InboundMessage,
    OutboundMessage, SdpKind, SessionDescription, UserCode,
};

pub mod types {
    pub mod events;
}

pub mod calls;
pub mod config;
pub mod error;
pub mod media;
pub mod signaling;
pub mod transport;

pub use calls::{CallHandlerHandle, HandlerSnapshot, spawn_call_handler};
pub use config::HandlerConfig;
pub use error::HandlerError;
pub use types::events::EventBus;
