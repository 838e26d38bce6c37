//! The narrow surface we consume from the vendor market-data SDK.
//!
//! The SDK dials the broker front-end on its own threads and reports back
//! through callbacks. We model the request half as [`MdApi`] and the
//! callback half as [`GatewayEvent`]s delivered on an unbounded channel, so
//! a connection can drive its state machine from one event stream
//! regardless of which thread the vendor library calls from.

use crate::error::Result;
use crate::tick::DepthTick;
use std::path::Path;
use tokio::sync::mpsc;

/// Diagnostic attached to a failed response.
#[derive(Debug, Clone)]
pub struct RspError {
    pub code: i32,
    pub message: String,
}

impl std::fmt::Display for RspError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

/// Callback events emitted by the SDK.
#[derive(Debug, Clone)]
pub enum GatewayEvent {
    /// The transport to the front-end is up; login may be requested.
    FrontConnected,
    /// The transport dropped; the SDK keeps redialing on its own.
    FrontDisconnected { reason: i32 },
    /// Response to a login request.
    LoginResponse {
        error: Option<RspError>,
        request_id: i32,
        is_last: bool,
    },
    /// Per-instrument acknowledgement of a subscribe request.
    SubscribeResponse {
        instrument_id: String,
        error: Option<RspError>,
        request_id: i32,
        is_last: bool,
    },
    /// One depth update.
    DepthTick(DepthTick),
    /// Out-of-band error report.
    Error {
        error: RspError,
        request_id: i32,
        is_last: bool,
    },
}

/// Request surface of the SDK. Calls are synchronous and fast; nonzero
/// return codes mean the request was not sent.
pub trait MdApi: Send + Sync {
    fn register_front(&self, front_addr: &str);
    fn init(&self);
    fn req_user_login(
        &self,
        broker_id: &str,
        user_id: &str,
        password: &str,
        request_id: i32,
    ) -> i32;
    fn subscribe(&self, instruments: &[String]) -> i32;
    fn unsubscribe(&self, instruments: &[String]) -> i32;
    /// Release the underlying handle. Called exactly once, as the terminal
    /// step of a connection's shutdown.
    fn release(&self);
}

/// Creates one API handle per connection, rooted at its flow directory.
pub trait MdApiFactory: Send + Sync {
    fn create(
        &self,
        flow_dir: &Path,
    ) -> Result<(Box<dyn MdApi>, mpsc::UnboundedReceiver<GatewayEvent>)>;
}
