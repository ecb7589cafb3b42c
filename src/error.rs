//! Error types for voxline
//!
//! Uses thiserror for ergonomic error definitions with clear messages
//! that guide users toward fixing common issues.

use thiserror::Error;

/// Top-level error type for the voxline application
#[derive(Error, Debug)]
pub enum VoxlineError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Audio device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors related to the microphone and speaker
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("Microphone access was denied: {0}\n  Grant this user access to the audio input device and try again.")]
    PermissionDenied(String),

    #[error("Audio device unavailable: {0}")]
    Unavailable(String),

    #[error("Audio device not found: '{0}'. List devices with: pactl list sources short")]
    NotFound(String),

    #[error("Audio stream error: {0}")]
    StreamError(String),

    #[error("Playback failed: {0}")]
    Playback(String),
}

/// Errors related to the remote voice service connection
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("No API key configured.\n  Set VOXLINE_API_KEY or transport.api_key in config.toml")]
    MissingCredential,

    #[error("Failed to connect to voice service: {0}")]
    Connect(String),

    #[error("Connection timed out after {0} seconds")]
    Timeout(u64),

    #[error("Connection dropped: {0}")]
    Dropped(String),

    #[error("Transport is not ready to send")]
    NotReady,

    #[error("Transport is closed")]
    Closed,

    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// Errors from the PCM codec that cannot be silently repaired
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Sample rate mismatch: expected {expected} Hz, got {actual} Hz")]
    RateMismatch { expected: u32, actual: u32 },

    #[error("Invalid channel count: {0}")]
    InvalidChannels(u16),

    #[error("Invalid transport encoding: {0}")]
    InvalidEncoding(String),

    #[error("Unrecognized encoding tag: '{0}'")]
    InvalidTag(String),
}

/// Result type alias using VoxlineError
pub type Result<T> = std::result::Result<T, VoxlineError>;

impl From<base64::DecodeError> for CodecError {
    fn from(e: base64::DecodeError) -> Self {
        CodecError::InvalidEncoding(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        TransportError::Dropped(e.to_string())
    }
}
