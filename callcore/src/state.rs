//! Call state machine implementation.

use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::Serialize;

use crate::error::CallError;
use crate::identity::UserCode;

/// Which side originated the offer for this session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CallRole {
    Caller,
    Callee,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EndReason {
    /// `end_call` on this side.
    LocalHangup,
    /// The peer sent `call-end`.
    RemoteHangup,
    /// The peer sent `call-reject`.
    Rejected,
    /// We rejected a ringing call.
    Declined,
    /// A newer session replaced this one.
    Replaced,
    NegotiationFailed,
    TransportFailed,
}

/// Current state of a call.
#[derive(Debug, Clone, Serialize, Default)]
pub enum CallState {
    #[default]
    Idle,
    /// Outgoing: local offer being created and gathered.
    Offering { started_at: DateTime<Utc> },
    /// Outgoing: offer sent, waiting for the answer.
    AwaitingAnswer { offer_sent_at: DateTime<Utc> },
    /// Incoming: offer stored, waiting for the local user to accept.
    Ringing { received_at: DateTime<Utc> },
    /// Incoming: remote offer applied, answer on its way.
    AnsweringOffer { accepted_at: DateTime<Utc> },
    Connected { connected_at: DateTime<Utc> },
    Ended {
        reason: EndReason,
        ended_at: DateTime<Utc>,
        duration_secs: Option<i64>,
    },
}

impl CallState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected { .. })
    }

    pub fn is_ended(&self) -> bool {
        matches!(self, Self::Ended { .. })
    }

    pub fn is_ringing(&self) -> bool {
        matches!(self, Self::Ringing { .. })
    }

    /// Our own offer is outstanding.
    pub fn is_offering(&self) -> bool {
        matches!(self, Self::Offering { .. } | Self::AwaitingAnswer { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Offering { .. } => "Offering",
            Self::AwaitingAnswer { .. } => "AwaitingAnswer",
            Self::Ringing { .. } => "Ringing",
            Self::AnsweringOffer { .. } => "AnsweringOffer",
            Self::Connected { .. } => "Connected",
            Self::Ended { .. } => "Ended",
        }
    }
}

/// State transitions for calls.
#[derive(Debug, Clone)]
pub enum CallTransition {
    OfferStarted,
    OfferSent,
    OfferReceived,
    Accepted,
    /// Both sides offered; this side rolled back and answers instead.
    GlareYield,
    AnswerApplied,
    MediaConnected,
    Terminated { reason: EndReason },
}

/// One logical call attempt.
#[derive(Debug, Clone, Serialize)]
pub struct CallSession {
    pub session_id: String,
    /// Identifies the transport session; bumped for every new one.
    pub generation: u64,
    pub role: CallRole,
    pub peer: UserCode,
    pub state: CallState,
    pub created_at: DateTime<Utc>,
    has_local_description: bool,
    has_remote_description: bool,
}

impl CallSession {
    pub fn new_outgoing(peer: UserCode, generation: u64) -> Self {
        Self::new(peer, generation, CallRole::Caller)
    }

    pub fn new_incoming(peer: UserCode, generation: u64) -> Self {
        Self::new(peer, generation, CallRole::Callee)
    }

    fn new(peer: UserCode, generation: u64, role: CallRole) -> Self {
        Self {
            session_id: generate_session_id(),
            generation,
            role,
            peer,
            state: CallState::Idle,
            created_at: Utc::now(),
            has_local_description: false,
            has_remote_description: false,
        }
    }

    pub fn is_caller(&self) -> bool {
        self.role == CallRole::Caller
    }

    pub fn is_live(&self) -> bool {
        !self.state.is_ended()
    }

    pub fn has_local_description(&self) -> bool {
        self.has_local_description
    }

    pub fn has_remote_description(&self) -> bool {
        self.has_remote_description
    }

    pub fn mark_local_description(&mut self) {
        self.has_local_description = true;
    }

    /// Records that the remote description was applied. A second call for
    /// the same generation is an error.
    pub fn mark_remote_description(&mut self) -> Result<(), CallError> {
        if self.has_remote_description {
            return Err(CallError::RemoteDescriptionAlreadySet {
                generation: self.generation,
            });
        }
        self.has_remote_description = true;
        Ok(())
    }

    /// Moves this session onto a fresh transport. Description flags belong
    /// to the old transport and are cleared.
    pub fn rebind(&mut self, generation: u64) {
        self.generation = generation;
        self.has_local_description = false;
        self.has_remote_description = false;
    }

    /// Apply a state transition. Returns error if transition is invalid.
    pub fn apply_transition(&mut self, transition: CallTransition) -> Result<(), InvalidTransition> {
        let new_state = match (&self.state, transition) {
            (CallState::Idle, CallTransition::OfferStarted) => CallState::Offering {
                started_at: Utc::now(),
            },
            (CallState::Idle, CallTransition::OfferReceived) => CallState::Ringing {
                received_at: Utc::now(),
            },
            (CallState::Offering { .. }, CallTransition::OfferSent) => CallState::AwaitingAnswer {
                offer_sent_at: Utc::now(),
            },
            (CallState::Ringing { .. }, CallTransition::Accepted) => CallState::AnsweringOffer {
                accepted_at: Utc::now(),
            },
            (
                CallState::Offering { .. } | CallState::AwaitingAnswer { .. },
                CallTransition::GlareYield,
            ) => {
                self.role = CallRole::Callee;
                CallState::AnsweringOffer {
                    accepted_at: Utc::now(),
                }
            }
            (CallState::AwaitingAnswer { .. }, CallTransition::AnswerApplied) => {
                CallState::Connected {
                    connected_at: Utc::now(),
                }
            }
            (CallState::AnsweringOffer { .. }, CallTransition::MediaConnected) => {
                CallState::Connected {
                    connected_at: Utc::now(),
                }
            }
            (CallState::Connected { connected_at }, CallTransition::Terminated { reason }) => {
                let duration = Utc::now().signed_duration_since(*connected_at).num_seconds();
                CallState::Ended {
                    reason,
                    ended_at: Utc::now(),
                    duration_secs: Some(duration),
                }
            }
            (current, CallTransition::Terminated { reason }) if !current.is_ended() => {
                CallState::Ended {
                    reason,
                    ended_at: Utc::now(),
                    duration_secs: None,
                }
            }
            (current, transition) => {
                return Err(InvalidTransition {
                    current_state: current.name().to_string(),
                    attempted: format!("{:?}", transition),
                });
            }
        };
        self.state = new_state;
        Ok(())
    }
}

fn generate_session_id() -> String {
    let mut bytes = [0u8; 8];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidTransition {
    pub current_state: String,
    pub attempted: String,
}

impl std::fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid transition {} in state {}",
            self.attempted, self.current_state
        )
    }
}

impl std::error::Error for InvalidTransition {}
