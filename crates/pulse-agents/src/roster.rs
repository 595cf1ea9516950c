use std::fmt;
use std::str::FromStr;

use pulse_core::ids::AgentId;
use serde::{Deserialize, Serialize};

/// The agents the backend hosts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AgentKind {
    ContentWriter,
    SeoAnalyst,
    GraphicDesigner,
}

#[derive(Debug, thiserror::Error)]
#[error("unknown agent: {0}")]
pub struct UnknownAgent(pub String);

impl AgentKind {
    pub const ALL: [AgentKind; 3] = [Self::ContentWriter, Self::SeoAnalyst, Self::GraphicDesigner];

    /// Wire id, as used in `agentId` and invocation requests.
    pub fn id(&self) -> &'static str {
        match self {
            Self::ContentWriter => "content-writer",
            Self::SeoAnalyst => "seo-analyst",
            Self::GraphicDesigner => "graphic-designer",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Self::ContentWriter => "Content Writer",
            Self::SeoAnalyst => "SEO Analyst",
            Self::GraphicDesigner => "Graphic Designer",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::ContentWriter => "Blog posts, social copy and email campaigns",
            Self::SeoAnalyst => "Keyword research, on-page audits and ranking advice",
            Self::GraphicDesigner => "Visual concepts, banners and brand assets",
        }
    }

    pub fn agent_id(&self) -> AgentId {
        AgentId::from_raw(self.id())
    }

    /// Roster entry for a wire id, if the agent is one we know.
    pub fn from_agent_id(id: &AgentId) -> Option<Self> {
        id.as_str().parse().ok()
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for AgentKind {
    type Err = UnknownAgent;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.id() == s)
            .ok_or_else(|| UnknownAgent(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_parse_back() {
        for kind in AgentKind::ALL {
            assert_eq!(kind.id().parse::<AgentKind>().unwrap(), kind);
        }
    }

    #[test]
    fn unknown_id_rejected() {
        let err = "copy-editor".parse::<AgentKind>().unwrap_err();
        assert_eq!(err.to_string(), "unknown agent: copy-editor");
    }

    #[test]
    fn serde_uses_wire_ids() {
        let json = serde_json::to_string(&AgentKind::SeoAnalyst).unwrap();
        assert_eq!(json, "\"seo-analyst\"");
        let back: AgentKind = serde_json::from_str("\"graphic-designer\"").unwrap();
        assert_eq!(back, AgentKind::GraphicDesigner);
    }

    #[test]
    fn display_names() {
        assert_eq!(AgentKind::SeoAnalyst.display_name(), "SEO Analyst");
        assert_eq!(AgentKind::ContentWriter.to_string(), "content-writer");
    }

    #[test]
    fn agent_id_lookup() {
        let id = AgentKind::GraphicDesigner.agent_id();
        assert_eq!(AgentKind::from_agent_id(&id), Some(AgentKind::GraphicDesigner));
        assert_eq!(AgentKind::from_agent_id(&AgentId::from_raw("nobody")), None);
    }
}
