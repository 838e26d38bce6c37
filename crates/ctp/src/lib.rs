//! Upstream market-data connectivity.
//!
//! This library owns everything between the vendor market-data SDK and the
//! WebSocket gateway:
//! - the narrow SDK surface ([`api::MdApi`]) plus its callback events;
//! - one lifecycle state machine per broker front-end
//!   ([`connection::MdConnection`]);
//! - the connection pool and load-balancing policies
//!   ([`manager::ConnectionManager`]);
//! - tick serialization into the wire schema ([`tick`]);
//! - an in-process front-end ([`sim`]) standing in for the vendor library.
//!
//! Connections publish ticks and state changes on a shared channel; the
//! gateway consumes that channel and fans quotes out to subscribers.

pub mod api;
pub mod connection;
pub mod error;
pub mod manager;
pub mod sim;
pub mod tick;

pub use api::{GatewayEvent, MdApi, MdApiFactory, RspError};
pub use connection::{ConnectionConfig, ConnectionStatus, MdConnection, MdEvent};
pub use error::{Error, Result};
pub use manager::{ConnectionManager, LoadBalanceStrategy};
pub use tick::{DepthTick, MarketTick};
