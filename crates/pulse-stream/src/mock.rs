use std::collections::VecDeque;

use async_trait::async_trait;
use parking_lot::Mutex;
use pulse_core::events::ActivityEvent;
use pulse_core::ids::SessionId;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::transport::{FrameStream, Transport, TransportError};

/// What the next `connect()` call does.
pub enum MockConnection {
    /// Fail the connect call itself.
    Refuse(TransportError),
    /// Deliver these frames, then end the stream (connection lost).
    Frames(Vec<String>),
    /// Deliver whatever the paired [`LiveHandle`] sends.
    Live(mpsc::UnboundedReceiver<Result<String, TransportError>>),
    /// Never complete the connect call.
    Pending,
}

impl MockConnection {
    /// A live connection plus the handle that drives it.
    pub fn live() -> (Self, LiveHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::Live(rx), LiveHandle { tx })
    }

    pub fn events(events: &[ActivityEvent]) -> Self {
        Self::Frames(events.iter().map(ActivityEvent::to_frame).collect())
    }
}

/// Server side of a [`MockConnection::Live`] connection.
pub struct LiveHandle {
    tx: mpsc::UnboundedSender<Result<String, TransportError>>,
}

impl LiveHandle {
    /// Returns false once the client has let go of the connection.
    pub fn send(&self, event: &ActivityEvent) -> bool {
        self.send_raw(event.to_frame())
    }

    pub fn send_raw(&self, frame: impl Into<String>) -> bool {
        self.tx.send(Ok(frame.into())).is_ok()
    }

    /// Break the connection with a transport error.
    pub fn fail(&self, reason: &str) -> bool {
        self.tx
            .send(Err(TransportError::Dropped(reason.to_string())))
            .is_ok()
    }

    /// End the stream cleanly.
    pub fn close(self) {}
}

/// Scripted transport for deterministic tests: each `connect()` pops the
/// next [`MockConnection`]. An exhausted script behaves like `Pending`.
#[derive(Default)]
pub struct MockTransport {
    script: Mutex<VecDeque<MockConnection>>,
    sessions: Mutex<Vec<SessionId>>,
}

impl MockTransport {
    pub fn new(script: Vec<MockConnection>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            sessions: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, connection: MockConnection) {
        self.script.lock().push_back(connection);
    }

    pub fn connect_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Session ids passed to `connect()`, in call order.
    pub fn sessions(&self) -> Vec<SessionId> {
        self.sessions.lock().clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, session_id: &SessionId) -> Result<FrameStream, TransportError> {
        self.sessions.lock().push(session_id.clone());
        let next = self.script.lock().pop_front();
        match next {
            Some(MockConnection::Refuse(err)) => Err(err),
            Some(MockConnection::Frames(frames)) => {
                let stream: FrameStream =
                    Box::pin(futures::stream::iter(frames.into_iter().map(Ok)));
                Ok(stream)
            }
            Some(MockConnection::Live(rx)) => {
                let stream: FrameStream = Box::pin(UnboundedReceiverStream::new(rx));
                Ok(stream)
            }
            Some(MockConnection::Pending) | None => futures::future::pending().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn script_is_consumed_in_order() {
        let transport = MockTransport::new(vec![
            MockConnection::Refuse(TransportError::Connect("refused".into())),
            MockConnection::events(&[ActivityEvent::started("content-writer", 1)]),
        ]);
        let session = SessionId::from_raw("s1");

        let err = transport.connect(&session).await.err().expect("refused");
        assert_eq!(err.error_kind(), "connect");

        let frames: Vec<_> = transport.connect(&session).await.unwrap().collect().await;
        assert_eq!(frames.len(), 1);
        assert_eq!(transport.connect_count(), 2);
    }

    #[tokio::test]
    async fn live_handle_feeds_stream() {
        let (connection, handle) = MockConnection::live();
        let transport = MockTransport::new(vec![connection]);
        let mut frames = transport.connect(&SessionId::from_raw("s1")).await.unwrap();

        assert!(handle.send_raw("hello"));
        assert!(handle.fail("reset"));
        handle.close();

        assert_eq!(frames.next().await.unwrap().unwrap(), "hello");
        assert!(frames.next().await.unwrap().is_err());
        assert!(frames.next().await.is_none());
    }
}
