//! External collaborators of the market-data server.
//!
//! This library wraps the two out-of-process data surfaces the server
//! consumes:
//! - Redis: last-tick snapshots, written on every depth update.
//! - The shared-memory instrument catalog, read-only at runtime.
//!
//! # Example
//!
//! ```ignore
//! use external_services::{InstrumentCatalog, MarketDataCache};
//!
//! let catalog = InstrumentCatalog::open_or_create("/dev/shm/mdcatalog")?;
//! let hits = catalog.search("rb");
//!
//! let cache = MarketDataCache::new("127.0.0.1", 6379)?;
//! cache.connect().await?;
//! ```

pub mod catalog;
pub mod error;
pub mod redis_client;

pub use catalog::InstrumentCatalog;
pub use error::{Error, Result};
pub use redis_client::{MarketDataCache, TickSnapshot};
