//! Payloads published to observers of a call handler.

use serde::Serialize;

use crate::identity::UserCode;
use crate::state::EndReason;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    /// Control channel is opening.
    Connecting,
    /// Control channel is open.
    Connected,
    /// Control channel dropped; background reconnection is running.
    Reconnecting,
    /// Control channel closed locally.
    Disconnected,
    MediaConnected,
    MediaDisconnected,
    MediaFailed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallReceived {
    pub caller: UserCode,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallRejected {
    pub peer: UserCode,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallEnded {
    pub peer: UserCode,
    pub reason: EndReason,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TextReceived {
    pub peer: Option<UserCode>,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranslationResult {
    pub label: serde_json::Value,
}
