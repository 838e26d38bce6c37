//! One stateful link to a broker market-data front-end.
//!
//! A connection owns an SDK handle and a pump task that drives the
//! lifecycle state machine from the SDK's callback events. Ticks are
//! stamped and serialized on the pump, forwarded to the shared event
//! channel, and snapshotted into the cache on a detached task.

use crate::api::{GatewayEvent, MdApi, MdApiFactory, RspError};
use crate::error::{Error, Result};
use crate::tick::{DepthTick, MarketTick};
use chrono::Utc;
use external_services::MarketDataCache;
use metrics::counter;
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI32, AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Static configuration for one upstream connection.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionConfig {
    pub connection_id: String,
    pub front_addr: String,
    pub broker_id: String,
    /// Market-data logins accept empty credentials.
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Scratch directory the SDK uses for its sequence numbers.
    pub flow_dir: PathBuf,
}

fn default_enabled() -> bool {
    true
}

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    LoggedIn,
    Error,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionStatus::Disconnected => "DISCONNECTED",
            ConnectionStatus::Connecting => "CONNECTING",
            ConnectionStatus::Connected => "CONNECTED",
            ConnectionStatus::LoggedIn => "LOGGED_IN",
            ConnectionStatus::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// What connections publish to the rest of the server.
#[derive(Debug, Clone)]
pub enum MdEvent {
    /// One serialized `market_data` frame, ready for fan-out.
    Tick {
        instrument_id: String,
        payload: String,
    },
    /// The connection reached LoggedIn (first login or recovery).
    ConnectionUp { connection_id: String },
    /// The connection left LoggedIn.
    ConnectionDown { connection_id: String },
}

/// One upstream connection with its lifecycle state machine.
pub struct MdConnection {
    config: ConnectionConfig,
    status: RwLock<ConnectionStatus>,
    error_detail: Mutex<Option<String>>,
    api: Mutex<Option<Box<dyn MdApi>>>,
    /// Instruments the gateway has acked a subscription for.
    instruments: Mutex<BTreeSet<String>>,
    request_id: AtomicI32,
    in_flight: AtomicI32,
    connect_successes: AtomicU32,
    error_count: AtomicU32,
    last_tick_ms: AtomicI64,
    events: mpsc::UnboundedSender<MdEvent>,
    cache: Option<Arc<MarketDataCache>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for MdConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MdConnection")
            .field("config", &self.config)
            .field("status", &self.status)
            .field("error_detail", &self.error_detail)
            .field("instruments", &self.instruments)
            .field("request_id", &self.request_id)
            .field("in_flight", &self.in_flight)
            .field("connect_successes", &self.connect_successes)
            .field("error_count", &self.error_count)
            .field("last_tick_ms", &self.last_tick_ms)
            .finish_non_exhaustive()
    }
}

impl MdConnection {
    pub fn new(
        config: ConnectionConfig,
        events: mpsc::UnboundedSender<MdEvent>,
        cache: Option<Arc<MarketDataCache>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            status: RwLock::new(ConnectionStatus::Disconnected),
            error_detail: Mutex::new(None),
            api: Mutex::new(None),
            instruments: Mutex::new(BTreeSet::new()),
            request_id: AtomicI32::new(0),
            in_flight: AtomicI32::new(0),
            connect_successes: AtomicU32::new(0),
            error_count: AtomicU32::new(0),
            last_tick_ms: AtomicI64::new(0),
            events,
            cache,
            pump: Mutex::new(None),
        })
    }

    pub fn connection_id(&self) -> &str {
        &self.config.connection_id
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.read()
    }

    /// Diagnostic from the last failure, if the connection is in Error.
    pub fn error_detail(&self) -> Option<String> {
        self.error_detail.lock().clone()
    }

    pub fn subscription_count(&self) -> usize {
        self.instruments.lock().len()
    }

    pub fn subscribed_instruments(&self) -> Vec<String> {
        self.instruments.lock().iter().cloned().collect()
    }

    pub fn in_flight_requests(&self) -> i32 {
        self.in_flight.load(Ordering::Relaxed).max(0)
    }

    /// Health score 0..100 from lifecycle state, login stability, tick
    /// freshness and error count.
    pub fn quality(&self) -> u8 {
        let base: i64 = match self.status() {
            ConnectionStatus::LoggedIn => 70,
            ConnectionStatus::Connected => 40,
            ConnectionStatus::Connecting => 20,
            ConnectionStatus::Disconnected | ConnectionStatus::Error => return 0,
        };
        let stability = i64::from(self.connect_successes.load(Ordering::Relaxed).min(2)) * 10;
        let freshness = match self.last_tick_ms.load(Ordering::Relaxed) {
            0 => 0,
            t => {
                let age_ms = Utc::now().timestamp_millis() - t;
                if age_ms <= 10_000 {
                    10
                } else if age_ms > 60_000 {
                    -20
                } else {
                    0
                }
            }
        };
        let errors = i64::from(self.error_count.load(Ordering::Relaxed).min(8)) * 5;
        (base + stability + freshness - errors).clamp(0, 100) as u8
    }

    /// Human-readable status for the health surface.
    pub fn status_line(&self) -> String {
        let status = self.status();
        let mut line = format!("{}: {}", self.config.connection_id, status);
        if status == ConnectionStatus::LoggedIn {
            line.push_str(&format!(" ({} subs)", self.subscription_count()));
        }
        line.push_str(&format!(" [Quality: {}%]", self.quality()));
        line
    }

    /// Create the SDK handle, register the front address and start dialing.
    /// The pump task owns all further state transitions.
    pub fn start(self: Arc<Self>, factory: &dyn MdApiFactory) -> Result<()> {
        if self.api.lock().is_some() {
            return Err(Error::AlreadyStarted(self.config.connection_id.clone()));
        }
        std::fs::create_dir_all(&self.config.flow_dir).map_err(|source| Error::FlowDirectory {
            dir: self.config.flow_dir.display().to_string(),
            source,
        })?;

        let (api, events) = factory.create(&self.config.flow_dir)?;
        api.register_front(&self.config.front_addr);
        self.set_status(ConnectionStatus::Connecting);
        api.init();
        *self.api.lock() = Some(api);

        let conn = Arc::clone(&self);
        let handle = tokio::spawn(async move { conn.run_pump(events).await });
        *self.pump.lock() = Some(handle);

        info!(
            "Connection {} dialing {}",
            self.config.connection_id, self.config.front_addr
        );
        Ok(())
    }

    /// Stop the pump and release the SDK handle. Release happens at most
    /// once; repeated stops are no-ops.
    pub fn stop(&self) {
        if let Some(handle) = self.pump.lock().take() {
            handle.abort();
        }
        if let Some(api) = self.api.lock().take() {
            api.release();
            info!("Connection {} released", self.config.connection_id);
        }
        self.set_status(ConnectionStatus::Disconnected);
    }

    /// Request gateway subscriptions. Only valid in LoggedIn; the acked
    /// instrument set grows when the per-instrument responses arrive.
    pub fn subscribe(&self, instruments: &[String]) -> Result<()> {
        if instruments.is_empty() {
            return Ok(());
        }
        if self.status() != ConnectionStatus::LoggedIn {
            return Err(Error::NotLoggedIn(self.config.connection_id.clone()));
        }
        let request_id = self.next_request_id();
        let ret = self.with_api(|api| api.subscribe(instruments))?;
        if ret != 0 {
            self.error_count.fetch_add(1, Ordering::Relaxed);
            return Err(Error::RequestRejected(ret));
        }
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        debug!(
            "Connection {} subscribe request {} ({} instruments)",
            self.config.connection_id,
            request_id,
            instruments.len()
        );
        Ok(())
    }

    /// Request gateway unsubscriptions. The surface carries no unsubscribe
    /// ack, so the acked set shrinks at request time.
    pub fn unsubscribe(&self, instruments: &[String]) -> Result<()> {
        if instruments.is_empty() {
            return Ok(());
        }
        if self.status() != ConnectionStatus::LoggedIn {
            return Err(Error::NotLoggedIn(self.config.connection_id.clone()));
        }
        let request_id = self.next_request_id();
        let ret = self.with_api(|api| api.unsubscribe(instruments))?;
        if ret != 0 {
            self.error_count.fetch_add(1, Ordering::Relaxed);
            return Err(Error::RequestRejected(ret));
        }
        {
            let mut set = self.instruments.lock();
            for instrument in instruments {
                set.remove(instrument);
            }
        }
        debug!(
            "Connection {} unsubscribe request {} ({} instruments)",
            self.config.connection_id,
            request_id,
            instruments.len()
        );
        Ok(())
    }

    fn next_request_id(&self) -> i32 {
        self.request_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn with_api<R>(&self, f: impl FnOnce(&dyn MdApi) -> R) -> Result<R> {
        let guard = self.api.lock();
        match guard.as_deref() {
            Some(api) => Ok(f(api)),
            None => Err(Error::NotStarted(self.config.connection_id.clone())),
        }
    }

    fn set_status(&self, next: ConnectionStatus) {
        let mut status = self.status.write();
        if *status != next {
            debug!(
                "Connection {} {} -> {}",
                self.config.connection_id, *status, next
            );
            *status = next;
        }
    }

    fn fail(&self, detail: String) {
        error!("Connection {}: {}", self.config.connection_id, detail);
        *self.error_detail.lock() = Some(detail);
        self.set_status(ConnectionStatus::Error);
        let _ = self.events.send(MdEvent::ConnectionDown {
            connection_id: self.config.connection_id.clone(),
        });
    }

    fn settle_request(&self) {
        let _ = self
            .in_flight
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                if v > 0 {
                    Some(v - 1)
                } else {
                    None
                }
            });
    }

    async fn run_pump(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<GatewayEvent>) {
        while let Some(event) = events.recv().await {
            self.handle_event(event);
        }
        debug!("Connection {} event pump ended", self.config.connection_id);
    }

    fn handle_event(&self, event: GatewayEvent) {
        match event {
            GatewayEvent::FrontConnected => self.on_front_connected(),
            GatewayEvent::FrontDisconnected { reason } => self.on_front_disconnected(reason),
            GatewayEvent::LoginResponse {
                error,
                request_id,
                is_last,
            } => self.on_login_response(error, request_id, is_last),
            GatewayEvent::SubscribeResponse {
                instrument_id,
                error,
                is_last,
                ..
            } => self.on_subscribe_response(instrument_id, error, is_last),
            GatewayEvent::DepthTick(tick) => self.on_depth_tick(tick),
            GatewayEvent::Error {
                error, request_id, ..
            } => {
                self.error_count.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "Connection {} gateway error (request {}): {}",
                    self.config.connection_id, request_id, error
                );
            }
        }
    }

    fn on_front_connected(&self) {
        info!("Connection {} front connected", self.config.connection_id);
        self.set_status(ConnectionStatus::Connected);

        let request_id = self.next_request_id();
        let ret = self.with_api(|api| {
            api.req_user_login(
                &self.config.broker_id,
                &self.config.user_id,
                &self.config.password,
                request_id,
            )
        });
        match ret {
            Ok(0) => {
                self.in_flight.fetch_add(1, Ordering::Relaxed);
                debug!(
                    "Connection {} login request {} sent",
                    self.config.connection_id, request_id
                );
            }
            Ok(code) => {
                self.error_count.fetch_add(1, Ordering::Relaxed);
                self.fail(format!("login request rejected, return code {}", code));
            }
            Err(e) => warn!(
                "Connection {} cannot send login: {}",
                self.config.connection_id, e
            ),
        }
    }

    fn on_front_disconnected(&self, reason: i32) {
        warn!(
            "Connection {} front disconnected, reason: {}",
            self.config.connection_id, reason
        );
        self.set_status(ConnectionStatus::Connecting);
        let _ = self.events.send(MdEvent::ConnectionDown {
            connection_id: self.config.connection_id.clone(),
        });
    }

    fn on_login_response(&self, error: Option<RspError>, request_id: i32, is_last: bool) {
        if is_last {
            self.settle_request();
        }
        if let Some(err) = error {
            self.error_count.fetch_add(1, Ordering::Relaxed);
            self.fail(format!("login failed: {}", err));
            return;
        }

        self.connect_successes.fetch_add(1, Ordering::Relaxed);
        *self.error_detail.lock() = None;

        // Recover the gateway-side subscription set before announcing
        // LoggedIn, so subscribers never observe a logged-in link that is
        // missing instruments it owns.
        let prior = self.subscribed_instruments();
        if !prior.is_empty() {
            info!(
                "Connection {} re-subscribing {} instruments after login",
                self.config.connection_id,
                prior.len()
            );
            match self.with_api(|api| api.subscribe(&prior)) {
                Ok(0) => {
                    self.in_flight.fetch_add(1, Ordering::Relaxed);
                }
                Ok(code) => {
                    self.error_count.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "Connection {} re-subscribe rejected, return code {}",
                        self.config.connection_id, code
                    );
                }
                Err(e) => warn!(
                    "Connection {} cannot re-subscribe: {}",
                    self.config.connection_id, e
                ),
            }
        }

        self.set_status(ConnectionStatus::LoggedIn);
        info!(
            "Connection {} logged in (request {})",
            self.config.connection_id, request_id
        );
        let _ = self.events.send(MdEvent::ConnectionUp {
            connection_id: self.config.connection_id.clone(),
        });
    }

    fn on_subscribe_response(
        &self,
        instrument_id: String,
        error: Option<RspError>,
        is_last: bool,
    ) {
        if is_last {
            self.settle_request();
        }
        match error {
            Some(err) => {
                self.error_count.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "Connection {} subscribe {} failed: {}",
                    self.config.connection_id, instrument_id, err
                );
            }
            None => {
                debug!(
                    "Connection {} subscribed {}",
                    self.config.connection_id, instrument_id
                );
                self.instruments.lock().insert(instrument_id);
            }
        }
    }

    fn on_depth_tick(&self, tick: DepthTick) {
        let timestamp = Utc::now().timestamp_millis();
        self.last_tick_ms.store(timestamp, Ordering::Relaxed);

        let frame = MarketTick::from_depth(&tick, timestamp);
        let payload = match serde_json::to_string(&frame) {
            Ok(json) => json,
            Err(e) => {
                warn!(
                    "Connection {} failed to serialize tick for {}: {}",
                    self.config.connection_id, tick.instrument_id, e
                );
                return;
            }
        };

        counter!("ctp_ticks_total", "connection" => self.config.connection_id.clone())
            .increment(1);
        let _ = self.events.send(MdEvent::Tick {
            instrument_id: tick.instrument_id,
            payload: payload.clone(),
        });

        // Snapshot writes run detached so a slow cache never delays the
        // next tick on this connection.
        if let Some(cache) = self.cache.clone() {
            let snapshot = frame.snapshot(payload);
            tokio::spawn(async move {
                if let Err(e) = cache.store_tick(&snapshot).await {
                    counter!("cache_write_errors_total").increment(1);
                    warn!(
                        "Failed to store snapshot for {}: {}",
                        snapshot.instrument_id, e
                    );
                }
            });
        }
    }
}
