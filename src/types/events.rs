use crate::error::HandlerError;
use crate::media::RemoteStream;
use std::sync::Arc;
use tokio::sync::broadcast;
pub use callcore::events::*;

// The size of the broadcast channel buffer.
pub const CHANNEL_CAPACITY: usize = 100;

// Macro to generate EventBus fields and constructor
macro_rules! define_event_bus {
    ($(($field:ident, $type:ty)),* $(,)?) => {
        /// Typed event bus with one broadcast channel per event kind.
        ///
        /// Publishing never fails: an event nobody subscribed to is dropped.
        #[derive(Debug)]
        pub struct EventBus {
            $(
                pub $field: broadcast::Sender<$type>,
            )*
        }

        impl EventBus {
            pub fn new() -> Self {
                Self::with_capacity(CHANNEL_CAPACITY)
            }

            pub fn with_capacity(capacity: usize) -> Self {
                Self {
                    $(
                        $field: broadcast::channel(capacity.max(1)).0,
                    )*
                }
            }
        }
    };
}

define_event_bus! {
    // Control channel and media path
    (connection_state, Arc<ConnectionState>),
    (error, Arc<HandlerError>),

    // Call lifecycle
    (call_received, Arc<CallReceived>),
    (call_rejected, Arc<CallRejected>),
    (call_ended, Arc<CallEnded>),
    (remote_stream, Arc<RemoteStream>),

    // Side channels
    (text_received, Arc<TextReceived>),
    (translation_result, Arc<TranslationResult>),
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub(crate) fn publish_state(&self, state: ConnectionState) {
        let _ = self.connection_state.send(Arc::new(state));
    }

    pub(crate) fn publish_error(&self, error: HandlerError) {
        let _ = self.error.send(Arc::new(error));
    }
}
