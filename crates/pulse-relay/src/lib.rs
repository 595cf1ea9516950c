//! Development relay: the backend side of the activity stream.
//!
//! Producers hand `(SessionId, ActivityEvent)` pairs to the relay, either
//! in-process through its broadcast channel or over HTTP, and the relay
//! fans each one out to the WebSocket clients bound to that session.

pub mod client;
pub mod event_bridge;
pub mod server;

pub use client::{ClientId, ClientRegistry};
pub use server::{build_router, start, RelayConfig, RelayError, RelayHandle};
