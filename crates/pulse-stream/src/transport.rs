use std::pin::Pin;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use pulse_core::ids::SessionId;
use tokio_tungstenite::tungstenite::Message;

/// Raw text frames from one live connection. The stream ends, or yields an
/// error, when the connection is lost.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String, TransportError>> + Send>>;

#[derive(Clone, Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("connection dropped: {0}")]
    Dropped(String),
    #[error("connection closed by peer")]
    Closed,
}

impl TransportError {
    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Connect(_) => "connect",
            Self::Dropped(_) => "dropped",
            Self::Closed => "closed",
        }
    }
}

/// Opens the inbound activity channel for a session.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn connect(&self, session_id: &SessionId) -> Result<FrameStream, TransportError>;
}

/// Query-component escaping: everything but unreserved characters.
const QUERY_VALUE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// WebSocket transport: one text frame per activity event.
#[derive(Clone, Debug)]
pub struct WebSocketTransport {
    endpoint: String,
}

impl WebSocketTransport {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn url_for(&self, session_id: &SessionId) -> String {
        let sep = if self.endpoint.contains('?') { '&' } else { '?' };
        format!(
            "{}{}session_id={}",
            self.endpoint,
            sep,
            utf8_percent_encode(session_id.as_str(), QUERY_VALUE)
        )
    }
}

fn text_of(
    message: Result<Message, tokio_tungstenite::tungstenite::Error>,
) -> Option<Result<String, TransportError>> {
    match message {
        Ok(Message::Text(text)) => Some(Ok(text.as_str().to_owned())),
        Ok(Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
            Ok(text) => Some(Ok(text)),
            Err(err) => {
                tracing::warn!(
                    reason = "invalid_utf8",
                    len = bytes.len(),
                    error = %err,
                    "dropping binary activity frame"
                );
                None
            }
        },
        Ok(Message::Close(_)) => Some(Err(TransportError::Closed)),
        Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => None,
        Err(e) => Some(Err(TransportError::Dropped(e.to_string()))),
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self, session_id: &SessionId) -> Result<FrameStream, TransportError> {
        let url = self.url_for(session_id);
        let (socket, _response) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        tracing::debug!(url = %url, "activity socket open");

        let frames = socket.filter_map(|message| futures::future::ready(text_of(message)));
        Ok(Box::pin(frames))
    }
}
