use crate::event::{EventKind, TimelineEvent};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// User-selected narrowing of the timeline. Every criterion that is set
/// must match; an empty descriptor matches everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FilterDescriptor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kinds: Option<BTreeSet<EventKind>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub case_id: Option<String>,
    /// Substring searched in the kind name, agent, run id and case id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl FilterDescriptor {
    pub fn kinds(kinds: impl IntoIterator<Item = EventKind>) -> Self {
        Self {
            kinds: Some(kinds.into_iter().collect()),
            ..Self::default()
        }
    }

    pub fn case(case_id: impl Into<String>) -> Self {
        Self {
            case_id: Some(case_id.into()),
            ..Self::default()
        }
    }

    pub fn text(needle: impl Into<String>) -> Self {
        Self {
            text: Some(needle.into()),
            ..Self::default()
        }
    }

    pub fn with_case(mut self, case_id: impl Into<String>) -> Self {
        self.case_id = Some(case_id.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_none() && self.case_id.is_none() && self.text.is_none()
    }

    pub fn matches(&self, event: &TimelineEvent) -> bool {
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&event.kind) {
                return false;
            }
        }
        if let Some(case_id) = &self.case_id {
            if !event.belongs_to_case(case_id) {
                return false;
            }
        }
        if let Some(needle) = &self.text {
            if !text_matches(needle, event) {
                return false;
            }
        }
        true
    }
}

fn text_matches(needle: &str, event: &TimelineEvent) -> bool {
    if needle.is_empty() {
        return true;
    }
    event.kind.as_str().contains(needle)
        || event
            .agent
            .as_ref()
            .is_some_and(|agent| agent.id().contains(needle))
        || event
            .run_id
            .as_deref()
            .is_some_and(|run_id| run_id.contains(needle))
        || event
            .case_id
            .as_deref()
            .is_some_and(|case_id| case_id.contains(needle))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::AgentRef;
    use chrono::Utc;

    fn event(kind: EventKind, case_id: Option<&str>, agent: Option<&str>) -> TimelineEvent {
        TimelineEvent {
            id: format!("{kind}-{}", case_id.unwrap_or("none")),
            kind,
            timestamp: Utc::now(),
            message: "m".to_string(),
            case_id: case_id.map(str::to_string),
            run_id: Some("run-12".to_string()),
            agent: agent.map(AgentRef::new),
            data: None,
        }
    }

    #[test]
    fn empty_descriptor_matches_everything() {
        let filter = FilterDescriptor::default();
        assert!(filter.is_empty());
        assert!(filter.matches(&event(EventKind::Error, None, None)));
    }

    #[test]
    fn kind_and_case_must_both_match() {
        let filter = FilterDescriptor::kinds([EventKind::CaseUpdated]).with_case("TW-1");
        assert!(filter.matches(&event(EventKind::CaseUpdated, Some("TW-1"), None)));
        assert!(!filter.matches(&event(EventKind::CaseUpdated, Some("TW-2"), None)));
        assert!(!filter.matches(&event(EventKind::CaseClosed, Some("TW-1"), None)));
    }

    #[test]
    fn text_searches_kind_agent_run_and_case() {
        let sample = event(EventKind::ToolCalled, Some("TW-77"), Some("compliance_guardian"));
        assert!(FilterDescriptor::text("tool").matches(&sample));
        assert!(FilterDescriptor::text("guardian").matches(&sample));
        assert!(FilterDescriptor::text("run-1").matches(&sample));
        assert!(FilterDescriptor::text("TW-7").matches(&sample));
        assert!(!FilterDescriptor::text("Guardian").matches(&sample));
        assert!(!FilterDescriptor::text("memory").matches(&sample));
    }
}
