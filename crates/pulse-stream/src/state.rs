//! Activity state and the pure fold over activity frames.
//!
//! Everything here is synchronous and deterministic: the same frames and
//! connection signals, in the same order, always produce the same state.

use std::collections::{HashSet, VecDeque};

use pulse_core::events::{ActivityEvent, ActivityKind};
use pulse_core::ids::AgentId;
use serde::Serialize;

pub const DEFAULT_RETENTION_CAP: usize = 200;

/// Remembered frame identities per retained event. Wider than the retention
/// window so a redelivered frame that was already evicted is still caught.
const DEDUPE_WINDOW_FACTOR: usize = 4;

/// Transport-level change folded alongside frames.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionSignal {
    Connected,
    Disconnected,
}

/// What a fold step did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// State changed.
    Applied,
    /// Frame was already seen; state untouched.
    Duplicate,
    /// Nothing to change (heartbeat, or a signal matching the current status).
    Ignored,
}

impl Outcome {
    pub fn changed(self) -> bool {
        self == Self::Applied
    }
}

/// Presentation-ready view of what the agents in one session are doing.
///
/// Invariant: `active_agent_id().is_some() == is_processing()`.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityState {
    is_connected: bool,
    is_processing: bool,
    active_agent_id: Option<AgentId>,
    active_agent_name: Option<String>,
    events: VecDeque<ActivityEvent>,
    thinking_events: VecDeque<ActivityEvent>,
    last_thinking_message: Option<String>,
    #[serde(skip)]
    retention_cap: usize,
    #[serde(skip)]
    seen: HashSet<(AgentId, u64)>,
    #[serde(skip)]
    seen_order: VecDeque<(AgentId, u64)>,
}

impl Default for ActivityState {
    fn default() -> Self {
        Self::new(DEFAULT_RETENTION_CAP)
    }
}

impl ActivityState {
    pub fn new(retention_cap: usize) -> Self {
        Self {
            is_connected: false,
            is_processing: false,
            active_agent_id: None,
            active_agent_name: None,
            events: VecDeque::new(),
            thinking_events: VecDeque::new(),
            last_thinking_message: None,
            retention_cap: retention_cap.max(1),
            seen: HashSet::new(),
            seen_order: VecDeque::new(),
        }
    }

    /// Rebuild a state by folding `events` into an empty one.
    pub fn replay(retention_cap: usize, events: impl IntoIterator<Item = ActivityEvent>) -> Self {
        events
            .into_iter()
            .fold(Self::new(retention_cap), reduce)
    }

    pub fn is_connected(&self) -> bool {
        self.is_connected
    }

    pub fn is_processing(&self) -> bool {
        self.is_processing
    }

    pub fn active_agent_id(&self) -> Option<&AgentId> {
        self.active_agent_id.as_ref()
    }

    pub fn active_agent_name(&self) -> Option<&str> {
        self.active_agent_name.as_deref()
    }

    pub fn events(&self) -> &VecDeque<ActivityEvent> {
        &self.events
    }

    pub fn thinking_events(&self) -> &VecDeque<ActivityEvent> {
        &self.thinking_events
    }

    pub fn last_thinking_message(&self) -> Option<&str> {
        self.last_thinking_message.as_deref()
    }

    pub fn retention_cap(&self) -> usize {
        self.retention_cap
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty() && !self.is_processing
    }

    /// Fold one frame.
    pub fn apply(&mut self, event: ActivityEvent) -> Outcome {
        if event.kind == ActivityKind::Heartbeat {
            return Outcome::Ignored;
        }
        if let Some(key) = event.dedupe_key() {
            if self.seen.contains(&key) {
                return Outcome::Duplicate;
            }
            self.remember(key);
        }

        match event.kind {
            ActivityKind::Started => {
                self.is_processing = true;
                self.active_agent_id = Some(event.agent_id.clone());
                self.active_agent_name = event.agent_name.clone();
            }
            ActivityKind::Thinking => {
                self.last_thinking_message = event.payload.clone();
                self.thinking_events.push_back(event.clone());
            }
            ActivityKind::Completed | ActivityKind::Failed => {
                // A terminal frame for some other agent is history only.
                if self.active_agent_id.as_ref() == Some(&event.agent_id) {
                    self.is_processing = false;
                    self.active_agent_id = None;
                    self.active_agent_name = None;
                    self.last_thinking_message = None;
                }
            }
            ActivityKind::Token | ActivityKind::Heartbeat => {}
        }

        self.events.push_back(event);
        self.enforce_retention();
        Outcome::Applied
    }

    /// Fold a connection change. A disconnect leaves any run in progress.
    pub fn apply_signal(&mut self, signal: ConnectionSignal) -> Outcome {
        let connected = signal == ConnectionSignal::Connected;
        if self.is_connected == connected {
            return Outcome::Ignored;
        }
        self.is_connected = connected;
        Outcome::Applied
    }

    fn remember(&mut self, key: (AgentId, u64)) {
        self.seen.insert(key.clone());
        self.seen_order.push_back(key);
        let window = self.retention_cap.saturating_mul(DEDUPE_WINDOW_FACTOR);
        while self.seen_order.len() > window {
            if let Some(old) = self.seen_order.pop_front() {
                self.seen.remove(&old);
            }
        }
    }

    /// `thinking_events` mirrors the thinking frames of `events`, so
    /// evicting one from `events` evicts its mirror too.
    fn enforce_retention(&mut self) {
        while self.events.len() > self.retention_cap {
            if let Some(evicted) = self.events.pop_front() {
                if evicted.kind == ActivityKind::Thinking {
                    self.thinking_events.pop_front();
                }
            }
        }
    }
}

/// `(state, event) -> state'`.
pub fn reduce(mut state: ActivityState, event: ActivityEvent) -> ActivityState {
    state.apply(event);
    state
}

/// `(state, signal) -> state'`.
pub fn reduce_signal(mut state: ActivityState, signal: ConnectionSignal) -> ActivityState {
    state.apply_signal(signal);
    state
}
