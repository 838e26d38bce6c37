//! WebSocket server handler using Axum.

use crate::dispatcher::SubscriptionDispatcher;
use crate::protocol::{parse_request, timestamp_ms, ClientRequest, ServerFrame};
use crate::session::{create_session_id, Session, SessionRegistry};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    http::{header, HeaderValue},
    response::IntoResponse,
    routing::get,
    Router,
};
use ctp::ConnectionManager;
use external_services::InstrumentCatalog;
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge};
use std::sync::Arc;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tower_http::set_header::SetResponseHeaderLayer;
use tracing::{info, warn};

/// Identifier sent in the handshake response.
const SERVER_NAME: &str = "MarketData-Gateway";

/// Shared application state.
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub dispatcher: Arc<SubscriptionDispatcher>,
    pub manager: Arc<ConnectionManager>,
    pub catalog: Arc<InstrumentCatalog>,
}

/// Create the WebSocket router.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(SetResponseHeaderLayer::overriding(
            header::SERVER,
            HeaderValue::from_static(SERVER_NAME),
        ))
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let (live, pending) = state.dispatcher.counts();
    axum::Json(serde_json::json!({
        "status": "ok",
        "sessions": state.registry.count(),
        "live_instruments": live,
        "pending_instruments": pending,
        "active_connections": state.manager.active_count(),
        "connections": state.manager.status_lines(),
    }))
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

/// Handle one WebSocket session from accept to teardown.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let session = Arc::new(Session::new(create_session_id(), tx));
    state.registry.register(session.clone());

    counter!("gateway_sessions_total").increment(1);
    gauge!("gateway_active_sessions").set(state.registry.count() as f64);
    info!("Session {} connected", session.id);

    // The only writer on this transport: frames go out in enqueue order and
    // writes never overlap.
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_tx.send(msg).await.is_err() {
                break;
            }
        }
    });

    if session.send(&welcome_frame(&state, &session.id)).is_ok() {
        while let Some(msg) = ws_rx.next().await {
            match msg {
                Ok(Message::Text(text)) => handle_frame(&state, &session, text.as_str()),
                Ok(Message::Binary(data)) => match std::str::from_utf8(&data) {
                    Ok(text) => handle_frame(&state, &session, text),
                    Err(_) => send_error(&session, "Invalid JSON format"),
                },
                // The transport layer answers pings on its own.
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
                Ok(Message::Close(_)) => break,
                Err(e) => {
                    warn!("Session {} read error: {}", session.id, e);
                    break;
                }
            }
        }
    }

    // Teardown order matters: release subscriptions before the registry
    // entry, and never hold the two structures' locks together.
    state.dispatcher.remove_all_subscriptions_for_session(&session.id);
    state.registry.unregister(&session.id);
    send_task.abort();

    gauge!("gateway_active_sessions").set(state.registry.count() as f64);
    counter!("gateway_sessions_closed_total").increment(1);
    info!("Session {} disconnected", session.id);
}

fn welcome_frame(state: &AppState, session_id: &str) -> ServerFrame {
    ServerFrame::Welcome {
        message: "Connected to MarketData Server".to_string(),
        session_id: session_id.to_string(),
        ctp_connected: state.manager.active_count() > 0,
        timestamp: timestamp_ms(),
    }
}

/// Decode and execute one request frame. Protocol errors produce a single
/// `error` frame and leave the session open.
fn handle_frame(state: &Arc<AppState>, session: &Arc<Session>, raw: &str) {
    let request = match parse_request(raw) {
        Ok(request) => request,
        Err(message) => {
            counter!("gateway_protocol_errors_total").increment(1);
            send_error(session, &message);
            return;
        }
    };

    match request {
        ClientRequest::Subscribe { instruments } => {
            for instrument_id in &instruments {
                session.subscriptions.insert(instrument_id.clone());
                state.dispatcher.add_subscription(&session.id, instrument_id);
            }
            counter!("gateway_subscribe_requests_total").increment(1);
            let _ = session.send(&ServerFrame::SubscribeResponse {
                status: "success".to_string(),
                subscribed_count: session.subscription_count(),
            });
        }
        ClientRequest::Unsubscribe { instruments } => {
            for instrument_id in &instruments {
                session.subscriptions.remove(instrument_id);
                state
                    .dispatcher
                    .remove_subscription(&session.id, instrument_id);
            }
            counter!("gateway_unsubscribe_requests_total").increment(1);
            let _ = session.send(&ServerFrame::UnsubscribeResponse {
                status: "success".to_string(),
                subscribed_count: session.subscription_count(),
            });
        }
        ClientRequest::ListInstruments => {
            let instruments = state.catalog.instruments();
            let _ = session.send(&ServerFrame::InstrumentList {
                count: instruments.len(),
                instruments,
            });
        }
        ClientRequest::SearchInstruments { pattern } => {
            let instruments = state.catalog.search(&pattern);
            let _ = session.send(&ServerFrame::SearchResult {
                pattern,
                count: instruments.len(),
                instruments,
            });
        }
    }
}

fn send_error(session: &Arc<Session>, message: &str) {
    let _ = session.send(&ServerFrame::error(message));
}
