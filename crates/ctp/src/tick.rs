//! Depth-tick types and wire serialization.

use external_services::TickSnapshot;
use serde::Serialize;

/// One depth update as delivered by the SDK, before stamping.
#[derive(Debug, Clone, Default)]
pub struct DepthTick {
    pub instrument_id: String,
    pub trading_day: String,
    pub update_time: String,
    pub last_price: f64,
    pub pre_settlement_price: f64,
    pub pre_close_price: f64,
    pub open_price: f64,
    pub highest_price: f64,
    pub lowest_price: f64,
    pub volume: i32,
    pub turnover: f64,
    pub open_interest: f64,
    pub upper_limit_price: f64,
    pub lower_limit_price: f64,
    pub bid_price1: f64,
    pub bid_volume1: i32,
    pub ask_price1: f64,
    pub ask_volume1: i32,
}

/// The `market_data` frame broadcast to subscribers and stored in Redis.
/// Serialized once per tick; the JSON is reused for every recipient.
#[derive(Debug, Clone, Serialize)]
pub struct MarketTick {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    pub instrument_id: String,
    pub trading_day: String,
    pub update_time: String,
    pub last_price: f64,
    pub pre_settlement_price: f64,
    pub pre_close_price: f64,
    pub open_price: f64,
    pub highest_price: f64,
    pub lowest_price: f64,
    pub volume: i32,
    pub turnover: f64,
    pub open_interest: f64,
    pub upper_limit_price: f64,
    pub lower_limit_price: f64,
    pub bid_price1: f64,
    pub bid_volume1: i32,
    pub ask_price1: f64,
    pub ask_volume1: i32,
    /// Receive timestamp, milliseconds since the Unix epoch.
    pub timestamp: i64,
}

impl MarketTick {
    /// Stamp a raw depth update with its receive time.
    pub fn from_depth(tick: &DepthTick, timestamp_ms: i64) -> Self {
        Self {
            msg_type: "market_data",
            instrument_id: tick.instrument_id.clone(),
            trading_day: tick.trading_day.clone(),
            update_time: tick.update_time.clone(),
            last_price: tick.last_price,
            pre_settlement_price: tick.pre_settlement_price,
            pre_close_price: tick.pre_close_price,
            open_price: tick.open_price,
            highest_price: tick.highest_price,
            lowest_price: tick.lowest_price,
            volume: tick.volume,
            turnover: tick.turnover,
            open_interest: tick.open_interest,
            upper_limit_price: tick.upper_limit_price,
            lower_limit_price: tick.lower_limit_price,
            bid_price1: tick.bid_price1,
            bid_volume1: tick.bid_volume1,
            ask_price1: tick.ask_price1,
            ask_volume1: tick.ask_volume1,
            timestamp: timestamp_ms,
        }
    }

    /// The cache form of this tick, carrying the already-serialized frame.
    pub fn snapshot(&self, json: String) -> TickSnapshot {
        TickSnapshot {
            instrument_id: self.instrument_id.clone(),
            trading_day: self.trading_day.clone(),
            update_time: self.update_time.clone(),
            last_price: self.last_price,
            volume: self.volume,
            json,
        }
    }
}
