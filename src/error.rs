//! Error types for the verba access layer.

/// Top-level error type for the metered inference core.
#[derive(Debug, thiserror::Error)]
pub enum VerbaError {
    /// Audio device or stream error.
    #[error("audio error: {0}")]
    Audio(String),

    /// Provider endpoint error (request build, transport, decode).
    #[error("provider error: {0}")]
    Provider(String),

    /// Credit ledger error.
    #[error("ledger error: {0}")]
    Ledger(String),

    /// Voice session error.
    #[error("session error: {0}")]
    Session(String),

    /// Duplex channel error.
    #[error("channel error: {0}")]
    Channel(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, VerbaError>;
