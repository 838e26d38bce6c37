//! Pool of upstream connections.
//!
//! The manager owns construction, startup and shutdown of the pool and
//! answers "which connection should carry instrument X" under the
//! configured load-balancing policy. It never reshuffles existing
//! assignments when a connection degrades: ownership is retained so the
//! link re-subscribes exactly its prior set on recovery.

use crate::api::MdApiFactory;
use crate::connection::{ConnectionConfig, ConnectionStatus, MdConnection, MdEvent};
use crate::error::{Error, Result};
use external_services::MarketDataCache;
use metrics::gauge;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, Instant};
use tracing::{info, warn};

/// How the dispatcher picks the owning connection for a new instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalanceStrategy {
    #[default]
    RoundRobin,
    LeastLoaded,
    BestQuality,
    Hash,
}

/// Owns the connection pool.
pub struct ConnectionManager {
    factory: Box<dyn MdApiFactory>,
    events: mpsc::UnboundedSender<MdEvent>,
    cache: Option<Arc<MarketDataCache>>,
    /// Insertion order is load-bearing: it breaks strategy ties.
    connections: RwLock<Vec<Arc<MdConnection>>>,
    round_robin: AtomicUsize,
}

impl ConnectionManager {
    pub fn new(
        factory: Box<dyn MdApiFactory>,
        events: mpsc::UnboundedSender<MdEvent>,
        cache: Option<Arc<MarketDataCache>>,
    ) -> Self {
        Self {
            factory,
            events,
            cache,
            connections: RwLock::new(Vec::new()),
            round_robin: AtomicUsize::new(0),
        }
    }

    /// Construct a connection in Disconnected state and add it to the pool.
    /// Does not start it.
    pub fn add_connection(&self, config: ConnectionConfig) -> Result<Arc<MdConnection>> {
        let mut connections = self.connections.write();
        if connections
            .iter()
            .any(|c| c.connection_id() == config.connection_id)
        {
            return Err(Error::DuplicateConnection(config.connection_id));
        }
        let conn = MdConnection::new(config, self.events.clone(), self.cache.clone());
        info!(
            "Added connection {} -> {}",
            conn.connection_id(),
            conn.config().front_addr
        );
        connections.push(conn.clone());
        gauge!("ctp_pool_size").set(connections.len() as f64);
        Ok(conn)
    }

    /// Start every connection, then wait up to `login_timeout` for at least
    /// one login. Best-effort: individual start failures are logged.
    pub async fn start_all(&self, login_timeout: Duration) -> bool {
        let connections = self.all_connections();
        for conn in &connections {
            if let Err(e) = conn.clone().start(self.factory.as_ref()) {
                warn!("Failed to start connection {}: {}", conn.connection_id(), e);
            }
        }

        let deadline = Instant::now() + login_timeout;
        while Instant::now() < deadline {
            if self.active_count() > 0 {
                return true;
            }
            sleep(Duration::from_millis(50)).await;
        }
        self.active_count() > 0
    }

    /// Stop every connection. Idempotent; SDK handles release exactly once.
    pub fn stop_all(&self) {
        for conn in self.all_connections() {
            conn.stop();
        }
        info!("All connections stopped");
    }

    /// Choose a LoggedIn connection for an instrument, or None when the
    /// whole pool is down (the caller marks the instrument pending).
    /// Ties break by insertion order.
    pub fn pick_connection(
        &self,
        instrument_id: &str,
        strategy: LoadBalanceStrategy,
    ) -> Option<Arc<MdConnection>> {
        let logged_in: Vec<Arc<MdConnection>> = self
            .connections
            .read()
            .iter()
            .filter(|c| c.status() == ConnectionStatus::LoggedIn)
            .cloned()
            .collect();
        if logged_in.is_empty() {
            return None;
        }

        let pick = match strategy {
            LoadBalanceStrategy::RoundRobin => {
                self.round_robin.fetch_add(1, Ordering::Relaxed) % logged_in.len()
            }
            LoadBalanceStrategy::LeastLoaded => {
                let mut best = 0;
                for (i, conn) in logged_in.iter().enumerate().skip(1) {
                    if conn.subscription_count() < logged_in[best].subscription_count() {
                        best = i;
                    }
                }
                best
            }
            LoadBalanceStrategy::BestQuality => {
                let mut best = 0;
                for (i, conn) in logged_in.iter().enumerate().skip(1) {
                    if conn.quality() > logged_in[best].quality() {
                        best = i;
                    }
                }
                best
            }
            LoadBalanceStrategy::Hash => {
                let mut hasher = DefaultHasher::new();
                instrument_id.hash(&mut hasher);
                (hasher.finish() as usize) % logged_in.len()
            }
        };
        Some(logged_in[pick].clone())
    }

    pub fn connection_by_id(&self, connection_id: &str) -> Option<Arc<MdConnection>> {
        self.connections
            .read()
            .iter()
            .find(|c| c.connection_id() == connection_id)
            .cloned()
    }

    pub fn all_connections(&self) -> Vec<Arc<MdConnection>> {
        self.connections.read().clone()
    }

    /// Connections currently in LoggedIn.
    pub fn active_count(&self) -> usize {
        self.connections
            .read()
            .iter()
            .filter(|c| c.status() == ConnectionStatus::LoggedIn)
            .count()
    }

    pub fn total_count(&self) -> usize {
        self.connections.read().len()
    }

    /// Per-connection status strings for the health surface.
    pub fn status_lines(&self) -> Vec<String> {
        self.connections
            .read()
            .iter()
            .map(|c| c.status_line())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimMdApiFactory;
    use std::path::Path;

    fn test_config(id: &str, dir: &Path) -> ConnectionConfig {
        ConnectionConfig {
            connection_id: id.to_string(),
            front_addr: format!("tcp://127.0.0.1:1013{}", id.len()),
            broker_id: "9999".to_string(),
            user_id: String::new(),
            password: String::new(),
            enabled: true,
            flow_dir: dir.join(id),
        }
    }

    fn manager_with(dir: &Path, ids: &[&str]) -> (Arc<ConnectionManager>, mpsc::UnboundedReceiver<MdEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let manager = Arc::new(ConnectionManager::new(
            Box::new(SimMdApiFactory::new()),
            tx,
            None,
        ));
        for id in ids {
            manager.add_connection(test_config(id, dir)).unwrap();
        }
        (manager, rx)
    }

    #[tokio::test]
    async fn test_start_all_reports_login() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _rx) = manager_with(dir.path(), &["a", "b"]);

        assert_eq!(manager.active_count(), 0);
        assert!(manager.start_all(Duration::from_secs(2)).await);
        assert_eq!(manager.active_count(), 2);

        manager.stop_all();
        assert_eq!(manager.active_count(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _rx) = manager_with(dir.path(), &["a"]);
        let err = manager
            .add_connection(test_config("a", dir.path()))
            .expect_err("duplicate id must be rejected");
        assert!(matches!(err, Error::DuplicateConnection(_)));
    }

    #[tokio::test]
    async fn test_pick_none_when_pool_down() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _rx) = manager_with(dir.path(), &["a", "b"]);
        assert!(manager
            .pick_connection("rb2410", LoadBalanceStrategy::RoundRobin)
            .is_none());
    }

    #[tokio::test]
    async fn test_round_robin_cycles() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _rx) = manager_with(dir.path(), &["a", "b"]);
        assert!(manager.start_all(Duration::from_secs(2)).await);

        let first = manager
            .pick_connection("rb2410", LoadBalanceStrategy::RoundRobin)
            .unwrap();
        let second = manager
            .pick_connection("rb2501", LoadBalanceStrategy::RoundRobin)
            .unwrap();
        let third = manager
            .pick_connection("cu2412", LoadBalanceStrategy::RoundRobin)
            .unwrap();

        assert_ne!(first.connection_id(), second.connection_id());
        assert_eq!(first.connection_id(), third.connection_id());
    }

    #[tokio::test]
    async fn test_least_loaded_prefers_empty_connection() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _rx) = manager_with(dir.path(), &["a", "b"]);
        assert!(manager.start_all(Duration::from_secs(2)).await);

        let a = manager.connection_by_id("a").unwrap();
        a.subscribe(&["rb2410".to_string(), "rb2501".to_string()])
            .unwrap();
        for _ in 0..100 {
            if a.subscription_count() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let pick = manager
            .pick_connection("cu2412", LoadBalanceStrategy::LeastLoaded)
            .unwrap();
        assert_eq!(pick.connection_id(), "b");
    }

    #[tokio::test]
    async fn test_hash_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _rx) = manager_with(dir.path(), &["a", "b", "c"]);
        assert!(manager.start_all(Duration::from_secs(2)).await);

        let first = manager
            .pick_connection("rb2410", LoadBalanceStrategy::Hash)
            .unwrap();
        for _ in 0..10 {
            let again = manager
                .pick_connection("rb2410", LoadBalanceStrategy::Hash)
                .unwrap();
            assert_eq!(first.connection_id(), again.connection_id());
        }
    }

    #[tokio::test]
    async fn test_ties_break_by_insertion_order() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _rx) = manager_with(dir.path(), &["a", "b", "c"]);
        assert!(manager.start_all(Duration::from_secs(2)).await);

        // All empty and equally healthy: LeastLoaded and BestQuality both
        // fall back to the first inserted connection.
        let least = manager
            .pick_connection("rb2410", LoadBalanceStrategy::LeastLoaded)
            .unwrap();
        assert_eq!(least.connection_id(), "a");
        let best = manager
            .pick_connection("rb2410", LoadBalanceStrategy::BestQuality)
            .unwrap();
        assert_eq!(best.connection_id(), "a");
    }

    #[test]
    fn test_strategy_config_names() {
        #[derive(Deserialize)]
        struct Wrapper {
            strategy: LoadBalanceStrategy,
        }
        for (name, want) in [
            ("round_robin", LoadBalanceStrategy::RoundRobin),
            ("least_loaded", LoadBalanceStrategy::LeastLoaded),
            ("best_quality", LoadBalanceStrategy::BestQuality),
            ("hash", LoadBalanceStrategy::Hash),
        ] {
            let wrapper: Wrapper =
                toml::from_str(&format!("strategy = \"{}\"", name)).unwrap();
            assert_eq!(wrapper.strategy, want);
        }
    }
}
