//! Downstream protocol frames.
//!
//! Requests are JSON documents tagged by `action`; every server frame is
//! tagged by `type`. Depth ticks are not modeled here: they arrive
//! pre-serialized from the upstream layer and are written through as-is.

use chrono::Utc;
use serde::{Deserialize, Serialize};

// ============================================================================
// Client → Server
// ============================================================================

/// Request sent by a downstream client.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientRequest {
    /// Add instruments to this session's subscription set.
    Subscribe { instruments: Vec<String> },
    /// Remove instruments from this session's subscription set.
    Unsubscribe { instruments: Vec<String> },
    /// Enumerate the instrument catalog.
    ListInstruments,
    /// Case-insensitive substring search over the catalog.
    SearchInstruments { pattern: String },
}

/// Parse one request frame, mapping each failure mode onto the diagnostic
/// the client protocol promises. Parse failures never close the transport.
pub fn parse_request(raw: &str) -> std::result::Result<ClientRequest, String> {
    let value: serde_json::Value =
        serde_json::from_str(raw).map_err(|_| "Invalid JSON format".to_string())?;

    let action = match value.get("action").and_then(|a| a.as_str()) {
        Some(action) => action.to_string(),
        None => return Err("Missing or invalid 'action' field".to_string()),
    };

    serde_json::from_value::<ClientRequest>(value).map_err(|_| match action.as_str() {
        "subscribe" | "unsubscribe" => "Missing or invalid 'instruments' field".to_string(),
        "search_instruments" => "Missing or invalid 'pattern' field".to_string(),
        _ => format!("Unknown action: {}", action),
    })
}

// ============================================================================
// Server → Client
// ============================================================================

/// Frame sent from server to client. The `market_data` frame is produced
/// upstream (see `ctp::MarketTick`) and bypasses this enum.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Unsolicited greeting sent once per accepted session.
    Welcome {
        message: String,
        session_id: String,
        ctp_connected: bool,
        timestamp: i64,
    },
    SubscribeResponse {
        status: String,
        subscribed_count: usize,
    },
    UnsubscribeResponse {
        status: String,
        subscribed_count: usize,
    },
    InstrumentList {
        instruments: Vec<String>,
        count: usize,
    },
    SearchResult {
        pattern: String,
        instruments: Vec<String>,
        count: usize,
    },
    Error {
        message: String,
        timestamp: i64,
    },
}

impl ServerFrame {
    pub fn error(message: impl Into<String>) -> Self {
        ServerFrame::Error {
            message: message.into(),
            timestamp: timestamp_ms(),
        }
    }
}

/// Milliseconds since the Unix epoch.
pub fn timestamp_ms() -> i64 {
    Utc::now().timestamp_millis()
}
