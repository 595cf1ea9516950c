//! Live agent-activity stream: a session-scoped connection whose frames are
//! folded into an [`ActivityState`] that watchers can read at any time.

pub mod backoff;
pub mod client;
pub mod state;
pub mod transport;

pub mod mock;

pub use backoff::ReconnectPolicy;
pub use client::{ActivityStreamClient, ActivityWatch, StreamConfig, StreamError};
pub use state::{reduce, reduce_signal, ActivityState, ConnectionSignal, Outcome};
pub use transport::{FrameStream, Transport, TransportError, WebSocketTransport};
