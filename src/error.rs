//! Error types for the client-facing edges: server, audio, sheets and config.

use thiserror::Error;

/// Failures talking to the game server.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Request never produced an HTTP response.
    #[error("network error: {0}")]
    Transport(String),
    /// Server answered with a non-success status.
    #[error("{message}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Server-provided message, or a generic one when absent.
        message: String,
    },
    /// Response body did not match the expected shape.
    #[error("unexpected response: {0}")]
    Decode(String),
}

impl ApiError {
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Failures opening the audio output. These are logged, never shown to gameplay.
#[derive(Debug, Error)]
pub enum AudioError {
    #[error("no output audio device available")]
    NoDevice,
    #[error("failed to get default output config: {0}")]
    Config(String),
    #[error("unsupported sample format: {0}")]
    UnsupportedFormat(String),
    #[error("failed to build output stream: {0}")]
    BuildStream(String),
    #[error("failed to play stream: {0}")]
    PlayStream(String),
    #[error("audio thread disconnected")]
    Disconnected,
}

/// Parse errors with location info
#[derive(Debug, Error)]
pub enum SheetError {
    #[error("line {line}: {message}")]
    Parse { line: usize, message: String },
    #[error("reading sheet file: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config: {0}")]
    Io(#[from] std::io::Error),
    #[error("parsing config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("writing config: {0}")]
    Serialize(#[from] toml::ser::Error),
}
