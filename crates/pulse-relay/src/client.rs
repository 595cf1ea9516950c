use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use pulse_core::events::ActivityEvent;
use pulse_core::ids::SessionId;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Floor for timer periods; `tokio::time::interval` rejects zero.
const MIN_INTERVAL: Duration = Duration::from_millis(10);

/// Unique client identifier.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ClientId(pub String);

impl Default for ClientId {
    fn default() -> Self {
        Self(format!("client_{}", Uuid::now_v7()))
    }
}

impl ClientId {
    pub fn new() -> Self {
        Self::default()
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A WebSocket client following one session's activity.
pub struct Client {
    pub id: ClientId,
    pub session_id: SessionId,
    tx: mpsc::Sender<String>,
    connected: AtomicBool,
    last_pong: AtomicU64,
}

impl Client {
    fn new(id: ClientId, session_id: SessionId, tx: mpsc::Sender<String>) -> Self {
        Self {
            id,
            session_id,
            tx,
            connected: AtomicBool::new(true),
            last_pong: AtomicU64::new(now_millis()),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn record_pong(&self) {
        self.last_pong.store(now_millis(), Ordering::Relaxed);
    }

    fn is_alive(&self, timeout: Duration) -> bool {
        let last = self.last_pong.load(Ordering::Relaxed);
        now_millis().saturating_sub(last) < timeout.as_millis() as u64
    }

    /// Queue a frame without waiting. A full queue drops the frame.
    fn try_send(&self, frame: &str) -> bool {
        match self.tx.try_send(frame.to_string()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(frame)) => {
                tracing::warn!(
                    client_id = %self.id,
                    session_id = %self.session_id,
                    frame_len = frame.len(),
                    "send queue full, dropping frame"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Every connected activity client, keyed by id.
pub struct ClientRegistry {
    clients: DashMap<ClientId, Arc<Client>>,
    max_send_queue: usize,
    client_timeout: Duration,
}

impl ClientRegistry {
    pub fn new(max_send_queue: usize, client_timeout: Duration) -> Self {
        Self {
            clients: DashMap::new(),
            max_send_queue: max_send_queue.max(1),
            client_timeout,
        }
    }

    /// Register a client bound to `session_id`; frames for it arrive on the
    /// returned receiver.
    pub fn register(&self, session_id: SessionId) -> (ClientId, mpsc::Receiver<String>) {
        let id = ClientId::new();
        let (tx, rx) = mpsc::channel(self.max_send_queue);
        let client = Arc::new(Client::new(id.clone(), session_id, tx));
        self.clients.insert(id.clone(), client);
        (id, rx)
    }

    pub fn unregister(&self, id: &ClientId) {
        if let Some((_, client)) = self.clients.remove(id) {
            client.connected.store(false, Ordering::Relaxed);
        }
    }

    pub fn send_to(&self, client_id: &ClientId, frame: &str) -> bool {
        self.clients
            .get(client_id)
            .is_some_and(|client| client.try_send(frame))
    }

    /// Queue `frame` for every live client of `session_id`. Returns how many
    /// accepted it.
    pub fn broadcast_to_session(&self, session_id: &SessionId, frame: &str) -> usize {
        self.clients
            .iter()
            .filter(|entry| &entry.session_id == session_id && entry.is_connected())
            .filter(|entry| entry.try_send(frame))
            .count()
    }

    pub fn count(&self) -> usize {
        self.clients.len()
    }

    pub fn count_for_session(&self, session_id: &SessionId) -> usize {
        self.clients
            .iter()
            .filter(|entry| &entry.session_id == session_id)
            .count()
    }

    pub fn clients_for_session(&self, session_id: &SessionId) -> Vec<ClientId> {
        self.clients
            .iter()
            .filter(|entry| &entry.session_id == session_id)
            .map(|entry| entry.id.clone())
            .collect()
    }

    fn record_pong(&self, client_id: &ClientId) {
        if let Some(client) = self.clients.get(client_id) {
            client.record_pong();
        }
    }

    fn mark_disconnected(&self, client_id: &ClientId) {
        if let Some(client) = self.clients.get(client_id) {
            client.connected.store(false, Ordering::Relaxed);
        }
    }

    /// Remove clients that are disconnected or stopped answering pings.
    pub fn cleanup_dead_clients(&self) -> usize {
        let dead: Vec<ClientId> = self
            .clients
            .iter()
            .filter(|entry| !entry.is_connected() || !entry.is_alive(self.client_timeout))
            .map(|entry| entry.id.clone())
            .collect();

        for id in &dead {
            self.unregister(id);
            tracing::info!(client_id = %id, "cleaned up dead client");
        }
        dead.len()
    }
}

/// Drive one client socket: queued frames and heartbeats out, pongs in.
pub async fn handle_ws_connection(
    socket: WebSocket,
    client_id: ClientId,
    mut rx: mpsc::Receiver<String>,
    registry: Arc<ClientRegistry>,
    heartbeat_interval: Duration,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let heartbeat_frame = ActivityEvent::heartbeat().to_frame();

    let writer_cid = client_id.clone();
    let writer_registry = Arc::clone(&registry);
    let writer = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(heartbeat_interval.max(MIN_INTERVAL));
        heartbeat.tick().await;

        loop {
            tokio::select! {
                frame = rx.recv() => {
                    let Some(frame) = frame else { break };
                    if ws_tx.send(WsMessage::Text(frame.into())).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if ws_tx.send(WsMessage::Text(heartbeat_frame.clone().into())).await.is_err() {
                        break;
                    }
                    if ws_tx.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                    tracing::trace!(client_id = %writer_cid, "sent heartbeat");
                }
            }
        }
        writer_registry.mark_disconnected(&writer_cid);
    });

    let reader_cid = client_id.clone();
    let reader_registry = Arc::clone(&registry);
    let reader = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            match msg {
                WsMessage::Pong(_) => reader_registry.record_pong(&reader_cid),
                WsMessage::Close(_) => break,
                // Inbound text has no meaning on this channel.
                WsMessage::Text(_) | WsMessage::Binary(_) => {
                    tracing::debug!(client_id = %reader_cid, "ignoring inbound frame");
                }
                WsMessage::Ping(_) => {}
            }
        }
    });

    let (writer_abort, reader_abort) = (writer.abort_handle(), reader.abort_handle());
    tokio::select! {
        _ = writer => reader_abort.abort(),
        _ = reader => writer_abort.abort(),
    }

    registry.unregister(&client_id);
    tracing::info!(client_id = %client_id, "activity client disconnected");
}

/// Periodically drop dead clients.
pub fn start_cleanup_task(
    registry: Arc<ClientRegistry>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval.max(MIN_INTERVAL));
        loop {
            ticker.tick().await;
            let removed = registry.cleanup_dead_clients();
            if removed > 0 {
                tracing::info!(removed, "dead client cleanup");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(queue: usize) -> ClientRegistry {
        ClientRegistry::new(queue, Duration::from_secs(90))
    }

    #[test]
    fn client_id_unique() {
        let a = ClientId::new();
        let b = ClientId::new();
        assert_ne!(a, b);
        assert!(a.0.starts_with("client_"));
    }

    #[test]
    fn register_and_unregister() {
        let registry = registry(32);
        let (id1, _rx1) = registry.register(SessionId::from_raw("s1"));
        let (id2, _rx2) = registry.register(SessionId::from_raw("s2"));
        assert_eq!(registry.count(), 2);

        registry.unregister(&id1);
        assert_eq!(registry.count(), 1);
        registry.unregister(&id2);
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn broadcast_reaches_only_session_clients() {
        let registry = registry(32);
        let s1 = SessionId::from_raw("s1");
        let (_a, mut rx_a) = registry.register(s1.clone());
        let (_b, mut rx_b) = registry.register(s1.clone());
        let (_c, mut rx_c) = registry.register(SessionId::from_raw("s2"));

        assert_eq!(registry.broadcast_to_session(&s1, "frame"), 2);
        assert_eq!(rx_a.try_recv().unwrap(), "frame");
        assert_eq!(rx_b.try_recv().unwrap(), "frame");
        assert!(rx_c.try_recv().is_err());
        assert_eq!(registry.count_for_session(&s1), 2);
        assert_eq!(registry.clients_for_session(&s1).len(), 2);
    }

    #[test]
    fn full_queue_drops_frames() {
        let registry = registry(2);
        let (id, _rx) = registry.register(SessionId::from_raw("s1"));

        assert!(registry.send_to(&id, "one"));
        assert!(registry.send_to(&id, "two"));
        assert!(!registry.send_to(&id, "three"));
    }

    #[test]
    fn send_to_unknown_client() {
        let registry = registry(4);
        assert!(!registry.send_to(&ClientId::new(), "x"));
    }

    #[test]
    fn closed_receiver_is_not_counted() {
        let registry = registry(4);
        let s1 = SessionId::from_raw("s1");
        let (_id, rx) = registry.register(s1.clone());
        drop(rx);
        assert_eq!(registry.broadcast_to_session(&s1, "frame"), 0);
    }

    #[test]
    fn cleanup_removes_silent_and_disconnected_clients() {
        let registry = registry(4);
        let (silent, _rx1) = registry.register(SessionId::from_raw("s1"));
        let (gone, _rx2) = registry.register(SessionId::from_raw("s1"));
        let (_live, _rx3) = registry.register(SessionId::from_raw("s1"));

        if let Some(client) = registry.clients.get(&silent) {
            client.last_pong.store(0, Ordering::Relaxed);
        }
        registry.mark_disconnected(&gone);

        assert_eq!(registry.cleanup_dead_clients(), 2);
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn pong_keeps_client_alive() {
        let registry = registry(4);
        let (id, _rx) = registry.register(SessionId::from_raw("s1"));
        if let Some(client) = registry.clients.get(&id) {
            client.last_pong.store(0, Ordering::Relaxed);
        }
        registry.record_pong(&id);
        assert_eq!(registry.cleanup_dead_clients(), 0);
    }
}
