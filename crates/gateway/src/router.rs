//! Upstream event router: connection events → dispatcher.
//!
//! A single task drains the shared channel all upstream connections publish
//! to. Keeping the fan-out on one task preserves per-connection tick order
//! end to end.

use crate::dispatcher::SubscriptionDispatcher;
use ctp::MdEvent;
use metrics::counter;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

pub struct MdEventRouter {
    dispatcher: Arc<SubscriptionDispatcher>,
}

impl MdEventRouter {
    pub fn new(dispatcher: Arc<SubscriptionDispatcher>) -> Self {
        Self { dispatcher }
    }

    /// Run until shutdown is signalled or every connection is gone.
    pub async fn run(
        self,
        mut events: mpsc::UnboundedReceiver<MdEvent>,
        mut shutdown_rx: mpsc::Receiver<()>,
    ) {
        info!("Market-data router running");
        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.recv() => {
                    info!("Market-data router received shutdown signal");
                    break;
                }

                event = events.recv() => {
                    match event {
                        Some(MdEvent::Tick { instrument_id, payload }) => {
                            self.dispatcher.on_tick(&instrument_id, &payload);
                        }
                        Some(MdEvent::ConnectionUp { connection_id }) => {
                            info!("Connection {} is up", connection_id);
                            counter!("gateway_connection_up_total").increment(1);
                            self.dispatcher.assign_pending();
                        }
                        Some(MdEvent::ConnectionDown { connection_id }) => {
                            // Ownership is retained on purpose: the link
                            // re-subscribes its set when it recovers.
                            warn!(
                                "Connection {} is down; retaining its instrument assignments",
                                connection_id
                            );
                            counter!("gateway_connection_down_total").increment(1);
                        }
                        None => {
                            warn!("Upstream event channel closed");
                            break;
                        }
                    }
                }
            }
        }
        info!("Market-data router stopped");
    }
}
