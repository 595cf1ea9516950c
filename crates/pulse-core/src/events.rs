use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::AgentId;

/// Kind of an activity frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    Started,
    Thinking,
    #[serde(alias = "delta")]
    Token,
    Completed,
    Failed,
    Heartbeat,
}

impl ActivityKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "started" => Some(Self::Started),
            "thinking" => Some(Self::Thinking),
            "token" | "delta" => Some(Self::Token),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "heartbeat" => Some(Self::Heartbeat),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Thinking => "thinking",
            Self::Token => "token",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Heartbeat => "heartbeat",
        }
    }

    /// `completed` and `failed` end an agent run.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for ActivityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One frame of an agent's live narration, as received on the activity stream.
///
/// Wire shape (camelCase JSON):
/// `{ kind, agentId, agentName?, sequence?, payload?, error?, timestamp? }`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityEvent {
    pub kind: ActivityKind,
    #[serde(default)]
    pub agent_id: AgentId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

/// Why an inbound frame was rejected.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("frame has no kind")]
    MissingKind,
    #[error("unknown frame kind: {0}")]
    UnknownKind(String),
    #[error("{0} frame has no agent id")]
    MissingAgentId(ActivityKind),
}

impl FrameError {
    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Malformed(_) => "malformed",
            Self::MissingKind => "missing_kind",
            Self::UnknownKind(_) => "unknown_kind",
            Self::MissingAgentId(_) => "missing_agent_id",
        }
    }
}

/// Loose view of a frame before validation. Field names accept both the
/// camelCase wire form and snake_case.
#[derive(Deserialize)]
struct RawFrame {
    kind: Option<String>,
    #[serde(alias = "agentId")]
    agent_id: Option<String>,
    #[serde(alias = "agentName")]
    agent_name: Option<String>,
    sequence: Option<u64>,
    payload: Option<Value>,
    error: Option<Value>,
    timestamp: Option<String>,
}

fn value_text(value: Option<Value>) -> Option<String> {
    match value? {
        Value::Null => None,
        Value::String(s) => Some(s),
        other => Some(other.to_string()),
    }
}

impl ActivityEvent {
    fn new(kind: ActivityKind, agent_id: impl Into<AgentId>, sequence: u64) -> Self {
        Self {
            kind,
            agent_id: agent_id.into(),
            agent_name: None,
            sequence: Some(sequence),
            payload: None,
            error: None,
            timestamp: None,
        }
    }

    pub fn started(agent_id: impl Into<AgentId>, sequence: u64) -> Self {
        Self::new(ActivityKind::Started, agent_id, sequence)
    }

    pub fn thinking(agent_id: impl Into<AgentId>, sequence: u64, text: impl Into<String>) -> Self {
        Self {
            payload: Some(text.into()),
            ..Self::new(ActivityKind::Thinking, agent_id, sequence)
        }
    }

    pub fn token(agent_id: impl Into<AgentId>, sequence: u64, text: impl Into<String>) -> Self {
        Self {
            payload: Some(text.into()),
            ..Self::new(ActivityKind::Token, agent_id, sequence)
        }
    }

    pub fn completed(agent_id: impl Into<AgentId>, sequence: u64) -> Self {
        Self::new(ActivityKind::Completed, agent_id, sequence)
    }

    pub fn failed(agent_id: impl Into<AgentId>, sequence: u64, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::new(ActivityKind::Failed, agent_id, sequence)
        }
    }

    pub fn heartbeat() -> Self {
        Self {
            kind: ActivityKind::Heartbeat,
            agent_id: AgentId::default(),
            agent_name: None,
            sequence: None,
            payload: None,
            error: None,
            timestamp: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.agent_name = Some(name.into());
        self
    }

    /// Decode and validate one text frame.
    ///
    /// Unknown kinds and frames without an agent id (other than heartbeats)
    /// are rejected; the caller drops them.
    pub fn from_frame(text: &str) -> Result<Self, FrameError> {
        let raw: RawFrame =
            serde_json::from_str(text).map_err(|e| FrameError::Malformed(e.to_string()))?;

        let kind_str = raw.kind.ok_or(FrameError::MissingKind)?;
        let kind =
            ActivityKind::parse(&kind_str).ok_or_else(|| FrameError::UnknownKind(kind_str))?;

        let agent_id = raw.agent_id.filter(|id| !id.is_empty());
        if agent_id.is_none() && kind != ActivityKind::Heartbeat {
            return Err(FrameError::MissingAgentId(kind));
        }

        Ok(Self {
            kind,
            agent_id: agent_id.map(AgentId::from_raw).unwrap_or_default(),
            agent_name: raw.agent_name.filter(|n| !n.is_empty()),
            sequence: raw.sequence,
            payload: value_text(raw.payload),
            error: value_text(raw.error),
            timestamp: raw.timestamp,
        })
    }

    pub fn to_frame(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Identity used to recognise a frame delivered twice. Frames without a
    /// sequence number have no identity and are never treated as duplicates.
    pub fn dedupe_key(&self) -> Option<(AgentId, u64)> {
        self.sequence.map(|seq| (self.agent_id.clone(), seq))
    }

    /// Text worth showing for this frame: the error for failures, the
    /// payload otherwise.
    pub fn display_text(&self) -> Option<&str> {
        match self.kind {
            ActivityKind::Failed => self.error.as_deref().or(self.payload.as_deref()),
            _ => self.payload.as_deref(),
        }
    }
}
