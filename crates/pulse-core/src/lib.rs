pub mod events;
pub mod ids;
pub mod settings;

pub use events::{ActivityEvent, ActivityKind, FrameError};
pub use ids::{AgentId, SessionId};
pub use settings::{PulseSettings, SettingsError};
