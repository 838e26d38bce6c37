//! In-process market-data front-end.
//!
//! Stands in for the vendor SDK wherever the real library is unavailable:
//! the test suites drive connections through it, and the server binary runs
//! against it out of the box. It acks dials, logins and subscribes
//! immediately; a [`SimHandle`] lets the caller inject depth ticks and
//! faults.

use crate::api::{GatewayEvent, MdApi, MdApiFactory, RspError};
use crate::error::Result;
use crate::tick::DepthTick;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

struct SimInner {
    events: mpsc::UnboundedSender<GatewayEvent>,
    front_addr: Mutex<String>,
    login_error: Mutex<Option<String>>,
    subscribe_log: Mutex<Vec<Vec<String>>>,
    unsubscribe_log: Mutex<Vec<Vec<String>>>,
    released: AtomicBool,
}

/// Simulated SDK handle for one connection.
pub struct SimMdApi {
    inner: Arc<SimInner>,
}

impl MdApi for SimMdApi {
    fn register_front(&self, front_addr: &str) {
        *self.inner.front_addr.lock() = front_addr.to_string();
    }

    fn init(&self) {
        let _ = self.inner.events.send(GatewayEvent::FrontConnected);
    }

    fn req_user_login(
        &self,
        _broker_id: &str,
        _user_id: &str,
        _password: &str,
        request_id: i32,
    ) -> i32 {
        let error = self
            .inner
            .login_error
            .lock()
            .take()
            .map(|message| RspError { code: -1, message });
        let _ = self.inner.events.send(GatewayEvent::LoginResponse {
            error,
            request_id,
            is_last: true,
        });
        0
    }

    fn subscribe(&self, instruments: &[String]) -> i32 {
        self.inner.subscribe_log.lock().push(instruments.to_vec());
        let last = instruments.len().saturating_sub(1);
        for (i, instrument_id) in instruments.iter().enumerate() {
            let _ = self.inner.events.send(GatewayEvent::SubscribeResponse {
                instrument_id: instrument_id.clone(),
                error: None,
                request_id: 0,
                is_last: i == last,
            });
        }
        0
    }

    fn unsubscribe(&self, instruments: &[String]) -> i32 {
        self.inner.unsubscribe_log.lock().push(instruments.to_vec());
        0
    }

    fn release(&self) {
        self.inner.released.store(true, Ordering::SeqCst);
    }
}

/// Control handle over a simulated front-end.
#[derive(Clone)]
pub struct SimHandle {
    inner: Arc<SimInner>,
}

impl SimHandle {
    /// Deliver a depth update as if the front-end pushed it.
    pub fn inject_tick(&self, tick: DepthTick) {
        let _ = self.inner.events.send(GatewayEvent::DepthTick(tick));
    }

    /// Drop the transport; the connection should fall back to Connecting.
    pub fn disconnect_front(&self, reason: i32) {
        let _ = self
            .inner
            .events
            .send(GatewayEvent::FrontDisconnected { reason });
    }

    /// Re-establish the transport, as the SDK's redial would.
    pub fn reconnect_front(&self) {
        let _ = self.inner.events.send(GatewayEvent::FrontConnected);
    }

    /// Make the next login attempt fail with the given diagnostic.
    pub fn set_login_error(&self, message: &str) {
        *self.inner.login_error.lock() = Some(message.to_string());
    }

    /// Deliver an out-of-band error report.
    pub fn inject_error(&self, code: i32, message: &str) {
        let _ = self.inner.events.send(GatewayEvent::Error {
            error: RspError {
                code,
                message: message.to_string(),
            },
            request_id: 0,
            is_last: true,
        });
    }

    /// Every subscribe request seen so far, in call order.
    pub fn subscribe_requests(&self) -> Vec<Vec<String>> {
        self.inner.subscribe_log.lock().clone()
    }

    /// Every unsubscribe request seen so far, in call order.
    pub fn unsubscribe_requests(&self) -> Vec<Vec<String>> {
        self.inner.unsubscribe_log.lock().clone()
    }

    pub fn released(&self) -> bool {
        self.inner.released.load(Ordering::SeqCst)
    }
}

/// Factory producing simulated handles. Keeps a handle per created
/// connection, in creation order, for callers that inject ticks.
#[derive(Default)]
pub struct SimMdApiFactory {
    handles: Mutex<Vec<SimHandle>>,
    initial_login_error: Mutex<Option<String>>,
}

impl SimMdApiFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm every subsequently created front-end to fail its first login.
    pub fn set_login_error(&self, message: &str) {
        *self.initial_login_error.lock() = Some(message.to_string());
    }

    /// Handle for the i-th created connection.
    pub fn handle(&self, index: usize) -> Option<SimHandle> {
        self.handles.lock().get(index).cloned()
    }

    pub fn handles(&self) -> Vec<SimHandle> {
        self.handles.lock().clone()
    }
}

impl MdApiFactory for Arc<SimMdApiFactory> {
    fn create(
        &self,
        flow_dir: &Path,
    ) -> Result<(Box<dyn MdApi>, mpsc::UnboundedReceiver<GatewayEvent>)> {
        self.as_ref().create(flow_dir)
    }
}

impl MdApiFactory for SimMdApiFactory {
    fn create(
        &self,
        _flow_dir: &Path,
    ) -> Result<(Box<dyn MdApi>, mpsc::UnboundedReceiver<GatewayEvent>)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(SimInner {
            events: tx,
            front_addr: Mutex::new(String::new()),
            login_error: Mutex::new(self.initial_login_error.lock().clone()),
            subscribe_log: Mutex::new(Vec::new()),
            unsubscribe_log: Mutex::new(Vec::new()),
            released: AtomicBool::new(false),
        });
        self.handles.lock().push(SimHandle {
            inner: inner.clone(),
        });
        Ok((Box::new(SimMdApi { inner }), rx))
    }
}

/// A plausible depth update for demos and tests.
pub fn sample_tick(instrument_id: &str) -> DepthTick {
    DepthTick {
        instrument_id: instrument_id.to_string(),
        trading_day: "20260802".to_string(),
        update_time: "09:30:00".to_string(),
        last_price: 3615.0,
        pre_settlement_price: 3600.0,
        pre_close_price: 3598.0,
        open_price: 3602.0,
        highest_price: 3620.0,
        lowest_price: 3597.0,
        volume: 1284,
        turnover: 46_432_800.0,
        open_interest: 2_103_400.0,
        upper_limit_price: 3960.0,
        lower_limit_price: 3240.0,
        bid_price1: 3614.0,
        bid_volume1: 57,
        ask_price1: 3616.0,
        ask_volume1: 43,
    }
}
