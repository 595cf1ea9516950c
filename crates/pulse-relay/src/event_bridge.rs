use std::sync::Arc;

use pulse_core::events::ActivityEvent;
use pulse_core::ids::SessionId;
use tokio::sync::broadcast;

use crate::client::ClientRegistry;

/// One activity frame addressed to a session.
pub type SessionEvent = (SessionId, ActivityEvent);

/// Forwards in-process activity events to the WebSocket clients of the
/// matching session.
pub struct EventBridge {
    registry: Arc<ClientRegistry>,
}

impl EventBridge {
    pub fn new(registry: Arc<ClientRegistry>) -> Self {
        Self { registry }
    }

    /// Spawn the forwarding task. It runs until every sender is dropped.
    pub fn start(&self, mut rx: broadcast::Receiver<SessionEvent>) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(&self.registry);

        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok((session_id, event)) => {
                        let delivered =
                            registry.broadcast_to_session(&session_id, &event.to_frame());
                        tracing::debug!(
                            session_id = %session_id,
                            kind = event.kind.as_str(),
                            delivered,
                            "relayed activity event"
                        );
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "event bridge lagged, dropped events");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        tracing::info!("event bridge channel closed");
                        break;
                    }
                }
            }
        })
    }
}

/// Create an event bridge wired to a broadcast channel.
pub fn create_bridge(
    registry: Arc<ClientRegistry>,
    rx: broadcast::Receiver<SessionEvent>,
) -> tokio::task::JoinHandle<()> {
    EventBridge::new(registry).start(rx)
}
