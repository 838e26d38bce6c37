//! Session state and registry.

use crate::error::{GatewayError, Result};
use crate::protocol::ServerFrame;
use axum::extract::ws::Message;
use chrono::Utc;
use dashmap::{DashMap, DashSet};
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Server-assigned session identifier.
pub type SessionId = String;

static SESSION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Wall clock, a process-wide counter and a random suffix: sortable by
/// creation time and unique even across quick restarts.
pub fn create_session_id() -> SessionId {
    let seq = SESSION_COUNTER.fetch_add(1, Ordering::Relaxed);
    let suffix: u32 = rand::thread_rng().gen_range(100_000..1_000_000);
    format!("session_{}_{}_{}", Utc::now().timestamp(), seq, suffix)
}

/// State for one connected client.
///
/// All outbound frames funnel through `tx`; a single writer task drains the
/// queue onto the transport, so frames leave in enqueue order and no two
/// writes overlap.
pub struct Session {
    pub id: SessionId,
    tx: mpsc::UnboundedSender<Message>,
    /// Instruments this session asked for, mirrored in the dispatcher.
    pub subscriptions: DashSet<String>,
    pub connected_at: i64,
}

impl Session {
    pub fn new(id: SessionId, tx: mpsc::UnboundedSender<Message>) -> Self {
        Self {
            id,
            tx,
            subscriptions: DashSet::new(),
            connected_at: Utc::now().timestamp_millis(),
        }
    }

    /// Enqueue a protocol frame.
    pub fn send(&self, frame: &ServerFrame) -> Result<()> {
        let json = serde_json::to_string(frame)?;
        self.send_raw(json)
    }

    /// Enqueue an already-serialized frame (tick fan-out path).
    pub fn send_raw(&self, json: String) -> Result<()> {
        self.tx
            .send(Message::Text(json.into()))
            .map_err(|_| GatewayError::ChannelSend)
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }
}

/// Registry of connected sessions.
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    pub fn register(&self, session: Arc<Session>) {
        debug!("Session {} registered", session.id);
        self.sessions.insert(session.id.clone(), session);
    }

    pub fn unregister(&self, session_id: &str) -> Option<Arc<Session>> {
        let removed = self.sessions.remove(session_id).map(|(_, s)| s);
        if removed.is_some() {
            info!("Session removed: {}", session_id);
        }
        removed
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.get(session_id).map(|s| s.clone())
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Drop every session. Their write queues close with them.
    pub fn clear(&self) {
        self.sessions.clear();
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_shape() {
        let a = create_session_id();
        let b = create_session_id();
        assert!(a.starts_with("session_"));
        assert_ne!(a, b);
        assert_eq!(a.split('_').count(), 4);
    }

    #[tokio::test]
    async fn test_frames_leave_in_enqueue_order() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = Session::new(create_session_id(), tx);

        for i in 0..100 {
            session.send_raw(format!("frame-{}", i)).unwrap();
        }

        for i in 0..100 {
            match rx.recv().await {
                Some(Message::Text(text)) => assert_eq!(text.as_str(), format!("frame-{}", i)),
                other => panic!("expected text frame, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_send_fails_after_writer_gone() {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Session::new(create_session_id(), tx);
        drop(rx);
        assert!(matches!(
            session.send_raw("x".to_string()),
            Err(GatewayError::ChannelSend)
        ));
    }

    #[tokio::test]
    async fn test_registry_roundtrip() {
        let registry = SessionRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let session = Arc::new(Session::new(create_session_id(), tx));
        let id = session.id.clone();

        registry.register(session);
        assert_eq!(registry.count(), 1);
        assert!(registry.get(&id).is_some());

        assert!(registry.unregister(&id).is_some());
        assert!(registry.get(&id).is_none());
        assert!(registry.unregister(&id).is_none());
    }
}
