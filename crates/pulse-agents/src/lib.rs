//! The remote agents Pulse can ask for work, and what they produced.

pub mod client;
pub mod recent;
pub mod roster;

pub use client::{
    AgentInvoker, AgentResponse, ArtifactFile, HttpAgentClient, InvokeError, InvokeOutcome,
    InvokeRequest, ModuleOutputs,
};
pub use recent::{RecentOutput, RecentOutputs, DEFAULT_RECENT_OUTPUTS};
pub use roster::{AgentKind, UnknownAgent};
