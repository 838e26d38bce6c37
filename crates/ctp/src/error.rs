//! Error types for upstream connectivity.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Failed to create flow directory {dir}: {source}")]
    FlowDirectory {
        dir: String,
        source: std::io::Error,
    },

    #[error("Failed to create market-data API handle: {0}")]
    ApiCreate(String),

    #[error("Connection {0} already started")]
    AlreadyStarted(String),

    #[error("Connection {0} has no API handle")]
    NotStarted(String),

    #[error("Connection {0} is not logged in")]
    NotLoggedIn(String),

    #[error("Duplicate connection id {0}")]
    DuplicateConnection(String),

    #[error("Gateway rejected request, return code {0}")]
    RequestRejected(i32),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
