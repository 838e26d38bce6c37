//! Subscription dispatcher: the session ↔ instrument ↔ connection index.
//!
//! The dispatcher de-duplicates downstream demand onto the upstream pool:
//! the first subscriber of an instrument triggers one gateway subscribe on
//! the connection the load-balancing policy picks; the last one leaving
//! triggers the unsubscribe. Instruments wanted while the whole pool is
//! down sit in a pending set until a connection logs in.
//!
//! One mutex guards the indexes and is held only across map updates.
//! Upstream SDK calls and per-session fan-out always run with the lock
//! released.

use crate::error::{GatewayError, Result};
use crate::session::{SessionId, SessionRegistry};
use ctp::{ConnectionManager, LoadBalanceStrategy};
use metrics::counter;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Default)]
struct Indexes {
    /// instrument → subscribed sessions.
    by_instrument: HashMap<String, HashSet<SessionId>>,
    /// session → subscribed instruments, for O(k) teardown.
    by_session: HashMap<SessionId, HashSet<String>>,
    /// instrument → connection carrying it upstream.
    owner: HashMap<String, String>,
    /// Instruments waiting for a LoggedIn connection.
    pending: HashSet<String>,
}

pub struct SubscriptionDispatcher {
    manager: Arc<ConnectionManager>,
    registry: Arc<SessionRegistry>,
    inner: Mutex<Indexes>,
    strategy: Mutex<LoadBalanceStrategy>,
}

impl SubscriptionDispatcher {
    pub fn new(
        manager: Arc<ConnectionManager>,
        registry: Arc<SessionRegistry>,
        strategy: LoadBalanceStrategy,
    ) -> Self {
        Self {
            manager,
            registry,
            inner: Mutex::new(Indexes::default()),
            strategy: Mutex::new(strategy),
        }
    }

    /// Affects only future assignments; owned instruments stay put.
    pub fn set_load_balance_strategy(&self, strategy: LoadBalanceStrategy) {
        *self.strategy.lock() = strategy;
    }

    pub fn load_balance_strategy(&self) -> LoadBalanceStrategy {
        *self.strategy.lock()
    }

    /// Record (session, instrument). The first subscriber of an instrument
    /// brings it live upstream.
    pub fn add_subscription(&self, session_id: &str, instrument_id: &str) {
        let newly_live = {
            let mut inner = self.inner.lock();
            let subscribers = inner
                .by_instrument
                .entry(instrument_id.to_string())
                .or_default();
            let inserted = subscribers.insert(session_id.to_string());
            let first = inserted && subscribers.len() == 1;
            inner
                .by_session
                .entry(session_id.to_string())
                .or_default()
                .insert(instrument_id.to_string());
            first
        };

        if newly_live {
            counter!("gateway_instruments_live_total").increment(1);
            self.activate_instrument(instrument_id);
        }
    }

    /// Remove (session, instrument). The last subscriber leaving takes the
    /// instrument down upstream.
    pub fn remove_subscription(&self, session_id: &str, instrument_id: &str) {
        let released_owner = {
            let mut inner = self.inner.lock();
            if let Some(subscribers) = inner.by_instrument.get_mut(instrument_id) {
                subscribers.remove(session_id);
            }
            let session_now_empty = match inner.by_session.get_mut(session_id) {
                Some(instruments) => {
                    instruments.remove(instrument_id);
                    instruments.is_empty()
                }
                None => false,
            };
            if session_now_empty {
                inner.by_session.remove(session_id);
            }

            let went_dead = inner
                .by_instrument
                .get(instrument_id)
                .is_some_and(|s| s.is_empty());
            if went_dead {
                inner.by_instrument.remove(instrument_id);
                inner.pending.remove(instrument_id);
                inner.owner.remove(instrument_id)
            } else {
                None
            }
        };

        if let Some(connection_id) = released_owner {
            match self.manager.connection_by_id(&connection_id) {
                Some(conn) => {
                    if let Err(e) = conn.unsubscribe(&[instrument_id.to_string()]) {
                        warn!("Upstream unsubscribe for {} failed: {}", instrument_id, e);
                    } else {
                        info!(
                            "Instrument {} released from connection {}",
                            instrument_id, connection_id
                        );
                    }
                }
                None => warn!(
                    "Owner connection {} for {} vanished",
                    connection_id, instrument_id
                ),
            }
        }
    }

    /// Drop every subscription a session holds. O(k) in the session's
    /// subscription count.
    pub fn remove_all_subscriptions_for_session(&self, session_id: &str) {
        let instruments: Vec<String> = {
            self.inner
                .lock()
                .by_session
                .get(session_id)
                .map(|s| s.iter().cloned().collect())
                .unwrap_or_default()
        };
        for instrument_id in &instruments {
            self.remove_subscription(session_id, instrument_id);
        }
        if !instruments.is_empty() {
            info!(
                "Released {} subscriptions for session {}",
                instruments.len(),
                session_id
            );
        }
    }

    /// Fan one serialized tick out to every subscriber. The subscriber list
    /// is snapshotted under the lock; enqueueing runs without it. Sessions
    /// gone since the snapshot are skipped.
    pub fn on_tick(&self, instrument_id: &str, payload: &str) {
        let subscribers: Vec<SessionId> = {
            let inner = self.inner.lock();
            match inner.by_instrument.get(instrument_id) {
                Some(sessions) if !sessions.is_empty() => sessions.iter().cloned().collect(),
                _ => return,
            }
        };

        counter!("gateway_ticks_routed_total").increment(1);
        for session_id in subscribers {
            if let Some(session) = self.registry.get(&session_id) {
                if session.send_raw(payload.to_string()).is_err() {
                    debug!("Session {} write queue closed, tick dropped", session_id);
                }
            }
        }
    }

    /// Try to place every pending instrument. Called when a connection
    /// reaches LoggedIn.
    pub fn assign_pending(&self) {
        let pending: Vec<String> = self.inner.lock().pending.iter().cloned().collect();
        if pending.is_empty() {
            return;
        }
        info!("Assigning {} pending instruments", pending.len());
        for instrument_id in pending {
            self.activate_instrument(&instrument_id);
        }
    }

    /// Supervisor hook: move an instrument's upstream subscription to a
    /// specific connection without touching the session indexes.
    pub fn reassign_instrument(&self, instrument_id: &str, to_connection_id: &str) -> Result<()> {
        let target = self
            .manager
            .connection_by_id(to_connection_id)
            .ok_or_else(|| GatewayError::UnknownConnection(to_connection_id.to_string()))?;

        let previous_owner = {
            let inner = self.inner.lock();
            if !inner.by_instrument.contains_key(instrument_id) {
                return Err(GatewayError::InstrumentNotLive(instrument_id.to_string()));
            }
            inner.owner.get(instrument_id).cloned()
        };

        target.subscribe(&[instrument_id.to_string()])?;
        {
            let mut inner = self.inner.lock();
            inner
                .owner
                .insert(instrument_id.to_string(), to_connection_id.to_string());
            inner.pending.remove(instrument_id);
        }

        if let Some(old_id) = previous_owner {
            if old_id != to_connection_id {
                if let Some(old) = self.manager.connection_by_id(&old_id) {
                    if let Err(e) = old.unsubscribe(&[instrument_id.to_string()]) {
                        warn!(
                            "Unsubscribe on former owner {} for {} failed: {}",
                            old_id, instrument_id, e
                        );
                    }
                }
            }
        }

        info!(
            "Instrument {} reassigned to connection {}",
            instrument_id, to_connection_id
        );
        Ok(())
    }

    /// (instruments with subscribers, instruments pending assignment).
    pub fn counts(&self) -> (usize, usize) {
        let inner = self.inner.lock();
        (inner.by_instrument.len(), inner.pending.len())
    }

    /// Sessions currently subscribed to an instrument.
    pub fn subscribers_of(&self, instrument_id: &str) -> Vec<SessionId> {
        self.inner
            .lock()
            .by_instrument
            .get(instrument_id)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Instruments a session is subscribed to.
    pub fn subscriptions_of(&self, session_id: &str) -> Vec<String> {
        self.inner
            .lock()
            .by_session
            .get(session_id)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// The connection carrying an instrument, if assigned.
    pub fn owner_of(&self, instrument_id: &str) -> Option<String> {
        self.inner.lock().owner.get(instrument_id).cloned()
    }

    pub fn is_pending(&self, instrument_id: &str) -> bool {
        self.inner.lock().pending.contains(instrument_id)
    }

    /// Instruments with at least one subscriber.
    pub fn live_instruments(&self) -> Vec<String> {
        self.inner.lock().by_instrument.keys().cloned().collect()
    }

    /// Pick a connection for a live instrument and subscribe it upstream,
    /// or park it in the pending set. The SDK call runs outside the index
    /// lock; the owner entry is recorded after the request is accepted.
    fn activate_instrument(&self, instrument_id: &str) {
        let strategy = self.load_balance_strategy();
        let conn = match self.manager.pick_connection(instrument_id, strategy) {
            Some(conn) => conn,
            None => {
                debug!(
                    "No LoggedIn connection for {}, marking pending",
                    instrument_id
                );
                self.inner.lock().pending.insert(instrument_id.to_string());
                return;
            }
        };

        match conn.subscribe(&[instrument_id.to_string()]) {
            Ok(()) => {
                let still_live = {
                    let mut inner = self.inner.lock();
                    let live = inner
                        .by_instrument
                        .get(instrument_id)
                        .is_some_and(|s| !s.is_empty());
                    if live {
                        inner
                            .owner
                            .insert(instrument_id.to_string(), conn.connection_id().to_string());
                        inner.pending.remove(instrument_id);
                    }
                    live
                };
                if still_live {
                    info!(
                        "Instrument {} assigned to connection {}",
                        instrument_id,
                        conn.connection_id()
                    );
                } else {
                    // The last subscriber left while the request was in
                    // flight; take the instrument back down.
                    let _ = conn.unsubscribe(&[instrument_id.to_string()]);
                }
            }
            Err(e) => {
                warn!(
                    "Upstream subscribe for {} on {} failed: {}; marking pending",
                    instrument_id,
                    conn.connection_id(),
                    e
                );
                self.inner.lock().pending.insert(instrument_id.to_string());
            }
        }
    }
}
