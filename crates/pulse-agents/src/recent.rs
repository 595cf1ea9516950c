use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use pulse_core::ids::AgentId;
use serde::Serialize;
use uuid::Uuid;

use crate::client::InvokeOutcome;

pub const DEFAULT_RECENT_OUTPUTS: usize = 10;

/// A successful agent answer, kept for quick recall.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecentOutput {
    pub id: String,
    pub agent_id: AgentId,
    pub prompt: String,
    pub text: String,
    pub artifact_count: usize,
    pub created_at: DateTime<Utc>,
}

/// Bounded in-memory list of recent outputs, newest first.
#[derive(Clone, Debug)]
pub struct RecentOutputs {
    capacity: usize,
    items: VecDeque<RecentOutput>,
}

impl Default for RecentOutputs {
    fn default() -> Self {
        Self::new(DEFAULT_RECENT_OUTPUTS)
    }
}

impl RecentOutputs {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            items: VecDeque::new(),
        }
    }

    /// Record a successful outcome. Outcomes with no text are skipped.
    pub fn record(
        &mut self,
        agent_id: AgentId,
        prompt: impl Into<String>,
        outcome: &InvokeOutcome,
    ) -> Option<&RecentOutput> {
        if !outcome.success {
            return None;
        }
        let text = outcome.result_text()?;
        self.items.push_front(RecentOutput {
            id: format!("out_{}", Uuid::now_v7()),
            agent_id,
            prompt: prompt.into(),
            text,
            artifact_count: outcome.artifacts().len(),
            created_at: Utc::now(),
        });
        self.items.truncate(self.capacity);
        self.items.front()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RecentOutput> {
        self.items.iter()
    }

    pub fn latest(&self) -> Option<&RecentOutput> {
        self.items.front()
    }

    pub fn get(&self, id: &str) -> Option<&RecentOutput> {
        self.items.iter().find(|item| item.id == id)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn outcome(result: serde_json::Value) -> InvokeOutcome {
        serde_json::from_value(json!({"success": true, "response": {"result": result}})).unwrap()
    }

    #[test]
    fn newest_first_and_bounded() {
        let mut recent = RecentOutputs::new(3);
        for i in 0..5 {
            recent.record(
                AgentId::from("content-writer"),
                format!("prompt {i}"),
                &outcome(json!(format!("answer {i}"))),
            );
        }
        assert_eq!(recent.len(), 3);
        let texts: Vec<_> = recent.iter().map(|o| o.text.as_str()).collect();
        assert_eq!(texts, vec!["answer 4", "answer 3", "answer 2"]);
    }

    #[test]
    fn failed_or_empty_outcomes_skipped() {
        let mut recent = RecentOutputs::default();
        let failed: InvokeOutcome =
            serde_json::from_value(json!({"success": false, "error": "x"})).unwrap();
        assert!(recent.record(AgentId::from("seo-analyst"), "p", &failed).is_none());
        let empty: InvokeOutcome = serde_json::from_value(json!({"success": true})).unwrap();
        assert!(recent.record(AgentId::from("seo-analyst"), "p", &empty).is_none());
        assert!(recent.is_empty());
        assert_eq!(recent.capacity(), DEFAULT_RECENT_OUTPUTS);
    }

    #[test]
    fn lookup_by_id() {
        let mut recent = RecentOutputs::default();
        let id = recent
            .record(
                AgentId::from("graphic-designer"),
                "banner",
                &outcome(json!({"palette": ["#fff"]})),
            )
            .map(|o| o.id.clone())
            .unwrap();
        let found = recent.get(&id).unwrap();
        assert!(found.text.contains("palette"));
        assert_eq!(recent.latest().map(|o| o.id.as_str()), Some(id.as_str()));
        recent.clear();
        assert!(recent.get(&id).is_none());
    }
}
