//! Redis snapshot store for last-tick market data.
//!
//! Every depth update is persisted twice: the full JSON frame under a flat
//! key, and a small hash with the fields downstream dashboards query by
//! name. Cache failures are reported to the caller, which logs them at
//! warning; they never block quote delivery.

use crate::error::{Error, Result};
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tokio::sync::RwLock;
use tracing::debug;

/// Redis key prefix for full-frame snapshots: market_data:{instrument_id}
pub const MARKET_DATA_KEY_PREFIX: &str = "market_data:";

/// Redis key prefix for per-field snapshots: market_data_hash:{instrument_id}
pub const MARKET_DATA_HASH_PREFIX: &str = "market_data_hash:";

/// The subset of a tick persisted as hash fields, plus the serialized frame.
#[derive(Debug, Clone)]
pub struct TickSnapshot {
    pub instrument_id: String,
    pub trading_day: String,
    pub update_time: String,
    pub last_price: f64,
    pub volume: i32,
    /// The full `market_data` frame, serialized once by the producer.
    pub json: String,
}

/// Async Redis client for market-data snapshots.
pub struct MarketDataCache {
    client: redis::Client,
    conn: RwLock<Option<MultiplexedConnection>>,
}

impl MarketDataCache {
    /// Create a client for the given host/port. Does not connect.
    pub fn new(host: &str, port: u16) -> Result<Self> {
        let client = redis::Client::open(format!("redis://{}:{}", host, port))?;
        Ok(Self {
            client,
            conn: RwLock::new(None),
        })
    }

    /// Establish the multiplexed connection used by all writes.
    pub async fn connect(&self) -> Result<()> {
        let conn = self.client.get_multiplexed_async_connection().await?;
        *self.conn.write().await = Some(conn);
        Ok(())
    }

    pub async fn is_connected(&self) -> bool {
        self.conn.read().await.is_some()
    }

    async fn connection(&self) -> Result<MultiplexedConnection> {
        self.conn
            .read()
            .await
            .clone()
            .ok_or(Error::NotConnected)
    }

    /// Set a flat key.
    pub async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.connection().await?;
        conn.set::<_, _, ()>(key, value).await?;
        Ok(())
    }

    /// Set one field of a hash key.
    pub async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut conn = self.connection().await?;
        conn.hset::<_, _, _, ()>(key, field, value).await?;
        Ok(())
    }

    /// Persist both snapshot forms for one tick.
    pub async fn store_tick(&self, snapshot: &TickSnapshot) -> Result<()> {
        let key = format!("{}{}", MARKET_DATA_KEY_PREFIX, snapshot.instrument_id);
        self.set(&key, &snapshot.json).await?;

        let hash_key = format!("{}{}", MARKET_DATA_HASH_PREFIX, snapshot.instrument_id);
        let mut conn = self.connection().await?;
        conn.hset::<_, _, _, ()>(&hash_key, "last_price", snapshot.last_price.to_string())
            .await?;
        conn.hset::<_, _, _, ()>(&hash_key, "volume", snapshot.volume.to_string())
            .await?;
        conn.hset::<_, _, _, ()>(&hash_key, "update_time", &snapshot.update_time)
            .await?;
        conn.hset::<_, _, _, ()>(&hash_key, "trading_day", &snapshot.trading_day)
            .await?;
        conn.hset::<_, _, _, ()>(&hash_key, "json_data", &snapshot.json)
            .await?;

        debug!("Stored snapshot for {}", snapshot.instrument_id);
        Ok(())
    }
}
