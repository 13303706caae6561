//! Runtime error taxonomy.
//!
//! The split matters for recovery: transport and parse errors are absorbed
//! near where they happen, provider errors degrade into conservative replies,
//! and storage errors are fatal only during strict startup.

use opencane_protocol::ProtocolError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Connection lost or publish failed; retried by the adapter, surfaced
    /// only when buffering overflows.
    #[error("transport error: {0}")]
    Transport(String),

    /// Adapter outbound queue is full; the command stays in
    /// `pending_commands` for replay.
    #[error("transport backpressure: outbound queue full")]
    TransportBackpressure,

    #[error("invalid control payload: {0}")]
    InvalidControlPayload(String),

    #[error("invalid audio frame: {0}")]
    InvalidAudioFrame(String),

    /// Closes the session with `close{reason:"unauthorized"}`.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("queue full")]
    QueueFull,

    #[error("operation timed out after {0}ms")]
    Timeout(u64),

    #[error("storage error: {0}")]
    Storage(String),
}

impl RuntimeError {
    /// Stable machine-readable code used in HTTP error envelopes.
    pub fn error_code(&self) -> &'static str {
        match self {
            RuntimeError::Transport(_) => "transport_error",
            RuntimeError::TransportBackpressure => "transport_backpressure",
            RuntimeError::InvalidControlPayload(_) => "invalid_control_payload",
            RuntimeError::InvalidAudioFrame(_) => "invalid_audio_frame",
            RuntimeError::Unauthorized(_) => "unauthorized",
            RuntimeError::Provider(_) => "provider_error",
            RuntimeError::QueueFull => "queue_full",
            RuntimeError::Timeout(_) => "timeout",
            RuntimeError::Storage(_) => "storage_error",
        }
    }
}

impl From<ProtocolError> for RuntimeError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::InvalidControlPayload(msg) => RuntimeError::InvalidControlPayload(msg),
            ProtocolError::InvalidAudioFrame(msg) => RuntimeError::InvalidAudioFrame(msg),
            ProtocolError::UnknownProfile(name) => {
                RuntimeError::InvalidControlPayload(format!("unknown profile: {name}"))
            }
        }
    }
}

impl From<rusqlite::Error> for RuntimeError {
    fn from(err: rusqlite::Error) -> Self {
        RuntimeError::Storage(err.to_string())
    }
}
