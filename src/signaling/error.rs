use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum SignalingError {
    #[error("relay unreachable after {attempts} attempts")]
    Unreachable { attempts: u32 },

    #[error("control channel is not open")]
    NotConnected,

    #[error("connect cancelled by hang-up")]
    Cancelled,

    #[error("control channel dropped")]
    Dropped,

    #[error("connect attempt timed out")]
    Timeout,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("failed to encode envelope: {0}")]
    Encode(String),
}
