//! Error types for the conversation broker.

/// Top-level error type for the voice conversation client.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// Audio device or stream error.
    #[error("audio error: {0}")]
    Audio(String),

    /// Transcription socket error.
    #[error("transcribe error: {0}")]
    Transcribe(String),

    /// Backend gateway request error.
    #[error("gateway error: {0}")]
    Gateway(String),

    /// Streaming response decode error.
    #[error("decode error: {0}")]
    Decode(String),

    /// Audio playback error.
    #[error("playback error: {0}")]
    Playback(String),

    /// Local message store error.
    #[error("store error: {0}")]
    Store(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, BrokerError>;
