//! End-to-end tests of the subscription core over a simulated upstream pool.

use axum::extract::ws::Message;
use ctp::sim::{sample_tick, SimHandle, SimMdApiFactory};
use ctp::{ConnectionConfig, ConnectionManager, LoadBalanceStrategy};
use gateway::session::create_session_id;
use gateway::{MdEventRouter, Session, SessionRegistry, SubscriptionDispatcher};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

struct Harness {
    factory: Arc<SimMdApiFactory>,
    manager: Arc<ConnectionManager>,
    registry: Arc<SessionRegistry>,
    dispatcher: Arc<SubscriptionDispatcher>,
    _router_shutdown: mpsc::Sender<()>,
    _dir: tempfile::TempDir,
}

impl Harness {
    async fn new(connections: usize, strategy: LoadBalanceStrategy, start: bool) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let factory = Arc::new(SimMdApiFactory::new());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let manager = Arc::new(ConnectionManager::new(
            Box::new(factory.clone()),
            events_tx,
            None,
        ));
        for i in 0..connections {
            manager
                .add_connection(ConnectionConfig {
                    connection_id: format!("ctp{:02}", i + 1),
                    front_addr: format!("tcp://127.0.0.1:{}", 10131 + i),
                    broker_id: "9999".to_string(),
                    user_id: String::new(),
                    password: String::new(),
                    enabled: true,
                    flow_dir: dir.path().join(format!("ctp{:02}", i + 1)),
                })
                .unwrap();
        }

        let registry = Arc::new(SessionRegistry::new());
        let dispatcher = Arc::new(SubscriptionDispatcher::new(
            manager.clone(),
            registry.clone(),
            strategy,
        ));

        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        tokio::spawn(MdEventRouter::new(dispatcher.clone()).run(events_rx, shutdown_rx));

        if start {
            assert!(manager.start_all(Duration::from_secs(2)).await);
        }

        Self {
            factory,
            manager,
            registry,
            dispatcher,
            _router_shutdown: shutdown_tx,
            _dir: dir,
        }
    }

    fn open_session(&self) -> (Arc<Session>, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Arc::new(Session::new(create_session_id(), tx));
        self.registry.register(session.clone());
        (session, rx)
    }

    /// Subscribe the way the frame handler does: session set + dispatcher.
    fn subscribe(&self, session: &Arc<Session>, instruments: &[&str]) {
        for instrument in instruments {
            session.subscriptions.insert(instrument.to_string());
            self.dispatcher.add_subscription(&session.id, instrument);
        }
    }

    fn unsubscribe(&self, session: &Arc<Session>, instruments: &[&str]) {
        for instrument in instruments {
            session.subscriptions.remove(*instrument);
            self.dispatcher.remove_subscription(&session.id, instrument);
        }
    }

    /// The sim handle behind the connection that owns an instrument.
    fn owner_handle(&self, instrument: &str) -> SimHandle {
        let owner = self.dispatcher.owner_of(instrument).expect("no owner");
        let index = self
            .manager
            .all_connections()
            .iter()
            .position(|c| c.connection_id() == owner)
            .expect("owner not in pool");
        self.factory.handle(index).expect("no sim handle")
    }
}

async fn wait_until(mut f: impl FnMut() -> bool) {
    for _ in 0..200 {
        if f() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition never became true");
}

async fn recv_frame(rx: &mut mpsc::UnboundedReceiver<Message>) -> serde_json::Value {
    match timeout(Duration::from_secs(1), rx.recv()).await {
        Ok(Some(Message::Text(text))) => serde_json::from_str(text.as_str()).unwrap(),
        other => panic!("expected a text frame, got {:?}", other),
    }
}

#[tokio::test]
async fn indexes_stay_mutual_inverses() {
    let h = Harness::new(2, LoadBalanceStrategy::RoundRobin, true).await;
    let (s1, _rx1) = h.open_session();
    let (s2, _rx2) = h.open_session();

    h.subscribe(&s1, &["rb2410", "rb2501"]);
    h.subscribe(&s2, &["rb2501", "cu2412"]);
    h.unsubscribe(&s1, &["rb2501"]);

    // Every edge present in one index is present in the other.
    for session in [&s1, &s2] {
        for instrument in h.dispatcher.subscriptions_of(&session.id) {
            assert!(
                h.dispatcher.subscribers_of(&instrument).contains(&session.id),
                "missing reverse edge {} -> {}",
                session.id,
                instrument
            );
        }
    }
    for instrument in h.dispatcher.live_instruments() {
        for session_id in h.dispatcher.subscribers_of(&instrument) {
            assert!(
                h.dispatcher.subscriptions_of(&session_id).contains(&instrument),
                "missing forward edge {} -> {}",
                instrument,
                session_id
            );
        }
    }

    assert_eq!(h.dispatcher.subscribers_of("rb2501"), vec![s2.id.clone()]);
    assert_eq!(h.dispatcher.subscribers_of("rb2410"), vec![s1.id.clone()]);
}

#[tokio::test]
async fn subscribe_unsubscribe_round_trip_restores_pre_state() {
    let h = Harness::new(1, LoadBalanceStrategy::RoundRobin, true).await;
    let (s1, _rx) = h.open_session();

    h.subscribe(&s1, &["rb2410", "cu2412"]);
    assert_eq!(h.dispatcher.counts().0, 2);
    assert!(h.dispatcher.owner_of("rb2410").is_some());

    h.unsubscribe(&s1, &["rb2410", "cu2412"]);
    assert_eq!(h.dispatcher.counts(), (0, 0));
    assert!(h.dispatcher.owner_of("rb2410").is_none());
    assert!(h.dispatcher.owner_of("cu2412").is_none());
    assert!(h.dispatcher.subscriptions_of(&s1.id).is_empty());
}

#[tokio::test]
async fn fan_out_subscribes_upstream_once() {
    let h = Harness::new(2, LoadBalanceStrategy::RoundRobin, true).await;
    let (s1, mut rx1) = h.open_session();
    let (s2, mut rx2) = h.open_session();
    let (_s3, mut rx3) = h.open_session();

    h.subscribe(&s1, &["rb2410"]);
    h.subscribe(&s2, &["rb2410"]);

    // Exactly one gateway subscribe across the whole pool.
    let total: usize = h
        .factory
        .handles()
        .iter()
        .flat_map(|handle| handle.subscribe_requests())
        .filter(|req| req.contains(&"rb2410".to_string()))
        .count();
    assert_eq!(total, 1);

    let owner = h.owner_handle("rb2410");
    owner.inject_tick(sample_tick("rb2410"));

    for rx in [&mut rx1, &mut rx2] {
        let frame = recv_frame(rx).await;
        assert_eq!(frame["type"], "market_data");
        assert_eq!(frame["instrument_id"], "rb2410");
        assert_eq!(frame["last_price"], 3615.0);
    }
    // The non-subscriber saw nothing.
    assert!(rx3.try_recv().is_err());
}

#[tokio::test]
async fn ticks_preserve_arrival_order_per_subscriber() {
    let h = Harness::new(1, LoadBalanceStrategy::RoundRobin, true).await;
    let (s1, mut rx) = h.open_session();
    h.subscribe(&s1, &["rb2410"]);

    let owner = h.owner_handle("rb2410");
    for i in 0..20 {
        let mut tick = sample_tick("rb2410");
        tick.volume = i;
        owner.inject_tick(tick);
    }
    for i in 0..20 {
        let frame = recv_frame(&mut rx).await;
        assert_eq!(frame["volume"], i);
    }
}

#[tokio::test]
async fn last_unsubscribe_releases_upstream() {
    let h = Harness::new(1, LoadBalanceStrategy::RoundRobin, true).await;
    let (s1, _rx1) = h.open_session();
    let (s2, _rx2) = h.open_session();

    h.subscribe(&s1, &["rb2410"]);
    h.subscribe(&s2, &["rb2410"]);
    let owner = h.owner_handle("rb2410");

    h.unsubscribe(&s1, &["rb2410"]);
    assert!(h.dispatcher.owner_of("rb2410").is_some());
    assert!(owner.unsubscribe_requests().is_empty());

    h.unsubscribe(&s2, &["rb2410"]);
    assert!(h.dispatcher.owner_of("rb2410").is_none());
    assert_eq!(owner.unsubscribe_requests(), vec![vec!["rb2410".to_string()]]);
}

#[tokio::test]
async fn session_teardown_releases_exactly_its_last_instruments() {
    let h = Harness::new(2, LoadBalanceStrategy::RoundRobin, true).await;
    let (s1, mut rx1) = h.open_session();
    let (s2, _rx2) = h.open_session();

    h.subscribe(&s1, &["a2409", "b2409", "c2409"]);
    h.subscribe(&s2, &["b2409"]);

    // Wait for the gateway-side acks so the upstream sets are settled.
    wait_until(|| {
        h.manager
            .all_connections()
            .iter()
            .map(|c| c.subscription_count())
            .sum::<usize>()
            == 3
    })
    .await;

    h.dispatcher.remove_all_subscriptions_for_session(&s1.id);
    h.registry.unregister(&s1.id);

    // No trace of the session anywhere.
    assert!(h.dispatcher.subscriptions_of(&s1.id).is_empty());
    for instrument in ["a2409", "b2409", "c2409"] {
        assert!(!h
            .dispatcher
            .subscribers_of(instrument)
            .contains(&s1.id));
    }

    // b2409 stays live for the second session; a and c went down upstream.
    assert!(h.dispatcher.owner_of("b2409").is_some());
    let mut released: Vec<String> = h
        .factory
        .handles()
        .iter()
        .flat_map(|handle| handle.unsubscribe_requests())
        .flatten()
        .collect();
    released.sort();
    assert_eq!(released, vec!["a2409".to_string(), "c2409".to_string()]);

    // Ticks for released instruments reach no one.
    for handle in h.factory.handles() {
        handle.inject_tick(sample_tick("a2409"));
        handle.inject_tick(sample_tick("c2409"));
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx1.try_recv().is_err());
}

#[tokio::test]
async fn pool_down_marks_pending_then_assigns_on_login() {
    let h = Harness::new(1, LoadBalanceStrategy::RoundRobin, false).await;
    let (s1, _rx) = h.open_session();

    h.subscribe(&s1, &["rb2410"]);
    assert!(h.dispatcher.is_pending("rb2410"));
    assert!(h.dispatcher.owner_of("rb2410").is_none());

    // The pool comes up; the router assigns pending instruments.
    assert!(h.manager.start_all(Duration::from_secs(2)).await);
    wait_until(|| h.dispatcher.owner_of("rb2410").is_some()).await;
    assert!(!h.dispatcher.is_pending("rb2410"));

    let requests = h.factory.handle(0).unwrap().subscribe_requests();
    assert!(requests.iter().any(|r| r.contains(&"rb2410".to_string())));
}

#[tokio::test]
async fn strategy_change_affects_only_future_assignments() {
    let h = Harness::new(2, LoadBalanceStrategy::RoundRobin, true).await;
    let (s1, _rx) = h.open_session();

    h.subscribe(&s1, &["rb2410"]);
    let first_owner = h.dispatcher.owner_of("rb2410").unwrap();
    wait_until(|| {
        h.manager
            .connection_by_id(&first_owner)
            .unwrap()
            .subscription_count()
            == 1
    })
    .await;

    h.dispatcher
        .set_load_balance_strategy(LoadBalanceStrategy::LeastLoaded);
    h.subscribe(&s1, &["cu2412"]);

    let second_owner = h.dispatcher.owner_of("cu2412").unwrap();
    assert_ne!(first_owner, second_owner);
    // The existing assignment did not move.
    assert_eq!(h.dispatcher.owner_of("rb2410").unwrap(), first_owner);
}

#[tokio::test]
async fn reassignment_hook_moves_upstream_subscription() {
    let h = Harness::new(2, LoadBalanceStrategy::RoundRobin, true).await;
    let (s1, _rx) = h.open_session();

    h.subscribe(&s1, &["rb2410"]);
    let old_owner = h.dispatcher.owner_of("rb2410").unwrap();
    let new_owner = h
        .manager
        .all_connections()
        .iter()
        .map(|c| c.connection_id().to_string())
        .find(|id| *id != old_owner)
        .unwrap();

    h.dispatcher
        .reassign_instrument("rb2410", &new_owner)
        .unwrap();

    assert_eq!(h.dispatcher.owner_of("rb2410").unwrap(), new_owner);
    let old_handle = {
        let index = h
            .manager
            .all_connections()
            .iter()
            .position(|c| c.connection_id() == old_owner)
            .unwrap();
        h.factory.handle(index).unwrap()
    };
    assert_eq!(
        old_handle.unsubscribe_requests(),
        vec![vec!["rb2410".to_string()]]
    );

    // Reassigning a dead instrument is refused.
    assert!(h
        .dispatcher
        .reassign_instrument("ag2412", &new_owner)
        .is_err());
}
