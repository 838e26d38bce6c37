//! Gateway error types.

use thiserror::Error;

/// Gateway error type.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Upstream connectivity error.
    #[error("Upstream error: {0}")]
    Upstream(#[from] ctp::Error),

    /// Config file could not be read.
    #[error("Config I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Config file could not be parsed.
    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// No such upstream connection.
    #[error("Unknown connection: {0}")]
    UnknownConnection(String),

    /// The instrument has no subscribers.
    #[error("Instrument not live: {0}")]
    InstrumentNotLive(String),

    /// Channel send error.
    #[error("Channel send error")]
    ChannelSend,
}

/// Result type for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;
