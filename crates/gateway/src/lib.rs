//! WebSocket gateway for real-time futures market data.
//!
//! This service:
//! - Accepts WebSocket sessions from downstream clients
//! - De-duplicates their instrument subscriptions onto a pool of upstream
//!   broker connections
//! - Routes depth ticks back out to every subscriber of the instrument
//! - Serves the shared-memory instrument catalog
//!
//! ## Architecture
//!
//! ```text
//! broker front-ends (ctp::MdConnection pool)
//!         ↓ MdEvent channel
//! MdEventRouter
//!         ↓
//! SubscriptionDispatcher (session ↔ instrument ↔ owning connection)
//!         ↓
//! SessionRegistry → per-session FIFO write queues → WebSocket clients
//! ```
//!
//! ## Ordering
//!
//! - One pump task per upstream connection, one router task, one writer
//!   task per session: ticks for an instrument from one connection reach
//!   each subscriber in arrival order, frames leave a session in enqueue
//!   order.
//! - The dispatcher lock is held only across index updates; fan-out and
//!   upstream SDK calls run outside it.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod protocol;
pub mod router;
pub mod session;
pub mod ws_server;

pub use config::ServerConfig;
pub use dispatcher::SubscriptionDispatcher;
pub use error::{GatewayError, Result};
pub use protocol::{ClientRequest, ServerFrame};
pub use router::MdEventRouter;
pub use session::{Session, SessionId, SessionRegistry};
pub use ws_server::{create_router, AppState};
