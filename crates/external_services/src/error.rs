//! Error types for external services.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Redis client not connected")]
    NotConnected,

    #[error("Invalid catalog segment: {0}")]
    InvalidSegment(String),
}

pub type Result<T> = std::result::Result<T, Error>;
