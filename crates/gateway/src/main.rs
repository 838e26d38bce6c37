//! Gateway service entry point.
//!
//! WebSocket distribution server for real-time futures market data.

use anyhow::Result;
use ctp::sim::SimMdApiFactory;
use ctp::ConnectionManager;
use external_services::{InstrumentCatalog, MarketDataCache};
use gateway::{
    create_router, AppState, MdEventRouter, ServerConfig, SessionRegistry,
    SubscriptionDispatcher,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::env;
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting MarketData gateway");

    let args: Vec<String> = env::args().skip(1).collect();
    let config = match args.len() {
        0 => ServerConfig::load(Path::new("config.toml"))?,
        1 => ServerConfig::load(Path::new(&args[0]))?,
        3 => {
            let port: u16 = args[2].parse()?;
            ServerConfig::single(&args[0], &args[1], port)
        }
        _ => anyhow::bail!(
            "usage: gateway [config.toml] | gateway <ctp_front_addr> <broker_id> <websocket_port>"
        ),
    };

    // Start Prometheus metrics server
    let metrics_port: u16 = env::var("METRICS_PORT")
        .unwrap_or_else(|_| "9095".to_string())
        .parse()?;
    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], metrics_port))
        .install()?;
    info!("Prometheus metrics server started on port {}", metrics_port);

    // Instrument catalog: absent or unreadable is never fatal.
    let catalog = match InstrumentCatalog::open_or_create(&config.catalog_path) {
        Ok(catalog) => {
            info!("Instrument catalog ready ({} entries)", catalog.len());
            Arc::new(catalog)
        }
        Err(e) => {
            warn!(
                "Instrument catalog unavailable ({}); serving an empty catalog",
                e
            );
            Arc::new(InstrumentCatalog::empty())
        }
    };

    // Redis snapshots: degrade to delivery-only when unreachable.
    let cache = match MarketDataCache::new(&config.cache_host, config.cache_port) {
        Ok(cache) => {
            let cache = Arc::new(cache);
            match cache.connect().await {
                Ok(()) => info!(
                    "Connected to Redis at {}:{}",
                    config.cache_host, config.cache_port
                ),
                Err(e) => {
                    error!(
                        "Failed to connect to Redis at {}:{}: {}",
                        config.cache_host, config.cache_port, e
                    );
                    warn!("Market data will not be stored in Redis");
                }
            }
            Some(cache)
        }
        Err(e) => {
            warn!("Invalid Redis target: {}; snapshots disabled", e);
            None
        }
    };

    // Upstream pool. The vendor SDK adapter plugs in through the same
    // factory seam the in-process front-end uses.
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let manager = Arc::new(ConnectionManager::new(
        Box::new(SimMdApiFactory::new()),
        events_tx,
        cache,
    ));
    for conn_config in &config.connections {
        if conn_config.enabled {
            manager.add_connection(conn_config.clone())?;
        } else {
            info!("Skipped disabled connection: {}", conn_config.connection_id);
        }
    }

    let registry = Arc::new(SessionRegistry::new());
    let dispatcher = Arc::new(SubscriptionDispatcher::new(
        manager.clone(),
        registry.clone(),
        config.load_balance_strategy,
    ));

    if manager.total_count() > 0 {
        if manager
            .start_all(Duration::from_secs(config.login_timeout_secs))
            .await
        {
            info!("Upstream pool ready ({} logged in)", manager.active_count());
        } else {
            warn!("No upstream connection reached LoggedIn; subscriptions stay pending");
        }
    } else {
        warn!("No enabled upstream connections configured");
    }

    // Route upstream events to the dispatcher.
    let (router_shutdown_tx, router_shutdown_rx) = mpsc::channel(1);
    let router = MdEventRouter::new(dispatcher.clone());
    let router_handle = tokio::spawn(router.run(events_rx, router_shutdown_rx));

    // Serve WebSocket sessions.
    let state = Arc::new(AppState {
        registry: registry.clone(),
        dispatcher,
        manager: manager.clone(),
        catalog,
    });
    let app = create_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.websocket_port));
    let listener = TcpListener::bind(addr).await?;
    info!("Gateway listening on {}", addr);

    tokio::select! {
        result = axum::serve(listener, app).into_future() => result?,
        _ = shutdown_signal() => info!("Shutting down"),
    }

    // Stop accepting, close sessions, then release the SDK handles last.
    let _ = router_shutdown_tx.send(()).await;
    let _ = router_handle.await;
    registry.clear();
    manager.stop_all();

    info!("Gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received terminate signal"),
    }
}
