//! Canonical protocol shared by transport adapters and the device runtime.
//!
//! Every transport dialect is normalized into one [`Envelope`] shape before it
//! reaches the runtime, and every outbound command is an [`Envelope`] until an
//! adapter serializes it for the wire.

pub mod audio_frame;
pub mod envelope;
pub mod profiles;

pub use audio_frame::{AudioFrame, DEFAULT_PACKET_MAGIC, FRAME_HEADER_LEN};
pub use envelope::{DeviceCommandType, DeviceEventType, Envelope, EnvelopeType};
pub use profiles::{resolve_profile, AudioUpMode, ModemProfile, ProfileOverrides};

use thiserror::Error;

/// Protocol-level parse failures. Both variants are recoverable: the frame or
/// payload is dropped and the session continues.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid control payload: {0}")]
    InvalidControlPayload(String),

    #[error("invalid audio frame: {0}")]
    InvalidAudioFrame(String),

    #[error("unknown modem profile: {0}")]
    UnknownProfile(String),
}
