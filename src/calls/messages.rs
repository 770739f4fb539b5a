use callcore::{CallRole, CallState, UserCode};
use tokio::sync::oneshot;

use crate::error::{HandlerError, Result};
use crate::media::{LocalMedia, PeerEvent};
use crate::signaling::SignalingState;

// --- Commands sent by CallHandlerHandle ---
#[derive(Debug)]
pub(crate) enum HandlerCommand {
    Initialize {
        media: LocalMedia,
        reply: oneshot::Sender<Result<()>>,
    },
    StartCall {
        target: UserCode,
        reply: oneshot::Sender<Result<()>>,
    },
    AcceptIncoming {
        reply: oneshot::Sender<Result<()>>,
    },
    RejectIncoming {
        caller: UserCode,
        reply: oneshot::Sender<Result<()>>,
    },
    EndCall {
        reply: oneshot::Sender<()>,
    },
    SendText {
        text: String,
        reply: oneshot::Sender<Result<()>>,
    },
    State {
        reply: oneshot::Sender<HandlerSnapshot>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

// --- Completions posted back by tasks the handler spawns ---
#[derive(Debug)]
pub(crate) enum LoopEvent {
    Peer { generation: u64, event: PeerEvent },
    LocalDescriptionReady {
        generation: u64,
        purpose: DescriptionPurpose,
    },
    IceRestartExpired { generation: u64 },
    /// The drain pause after a failed transport is over.
    RedialDue {
        token: u64,
        target: Option<UserCode>,
    },
}

/// Work parked until the control channel opens.
#[derive(Debug)]
pub(crate) enum Deferred {
    Initialize(oneshot::Sender<Result<()>>),
    /// `reply` is `None` for the re-dial after a failed transport.
    StartCall {
        target: UserCode,
        reply: Option<oneshot::Sender<Result<()>>>,
    },
}

impl Deferred {
    pub(crate) fn fail(self, error: HandlerError) {
        match self {
            Self::Initialize(reply) => {
                let _ = reply.send(Err(error));
            }
            Self::StartCall {
                reply: Some(reply), ..
            } => {
                let _ = reply.send(Err(error));
            }
            Self::StartCall { reply: None, .. } => {}
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DescriptionPurpose {
    Offer,
    Answer,
}

/// Point-in-time view of a handler, returned by `state()`.
#[derive(Debug, Clone)]
pub struct HandlerSnapshot {
    pub identity: UserCode,
    pub signaling: SignalingState,
    pub retry_count: u32,
    /// `Idle` when no call was ever made; the last call's state otherwise.
    pub call_state: CallState,
    pub peer: Option<UserCode>,
    pub role: Option<CallRole>,
    pub session_id: Option<String>,
    pub generation: Option<u64>,
    pub pending_candidates: usize,
    pub data_channel_open: bool,
}

impl HandlerSnapshot {
    pub fn is_connected(&self) -> bool {
        self.call_state.is_connected()
    }
}
