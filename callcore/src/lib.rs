//! Platform-independent core of the call signaling engine.
//!
//! Everything in this crate is free of I/O: identities, the JSON envelopes
//! exchanged with the relay, the per-call state machine, the buffer for
//! early remote candidates and the payloads published to observers. The
//! `peercall` crate drives these types from its handler task.

pub mod error;
pub mod events;
pub mod identity;
pub mod pending;
pub mod protocol;
pub mod state;

pub use error::CallError;
pub use identity::{IdentityError, UserCode};
pub use pending::PendingCandidates;
pub use protocol::{IceCandidate, InboundMessage, OutboundMessage, SdpKind, SessionDescription};
pub use state::{CallRole, CallSession, CallState, CallTransition, EndReason, InvalidTransition};
