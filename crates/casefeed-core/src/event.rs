use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    RunStarted,
    RunCompleted,
    RunFailed,
    AgentInvoked,
    AgentCompleted,
    AgentError,
    ToolCalled,
    ToolResult,
    CaseCreated,
    CaseUpdated,
    CaseClosed,
    MemoryQuery,
    MemoryWrite,
    PatternMatched,
    HumanReviewRequested,
    HumanFeedbackReceived,
    SystemMessage,
    Error,
}

impl EventKind {
    pub const ALL: [EventKind; 18] = [
        Self::RunStarted,
        Self::RunCompleted,
        Self::RunFailed,
        Self::AgentInvoked,
        Self::AgentCompleted,
        Self::AgentError,
        Self::ToolCalled,
        Self::ToolResult,
        Self::CaseCreated,
        Self::CaseUpdated,
        Self::CaseClosed,
        Self::MemoryQuery,
        Self::MemoryWrite,
        Self::PatternMatched,
        Self::HumanReviewRequested,
        Self::HumanFeedbackReceived,
        Self::SystemMessage,
        Self::Error,
    ];

    /// Kind substituted for wire kinds outside the known set.
    pub const FALLBACK: EventKind = EventKind::SystemMessage;

    pub fn as_str(self) -> &'static str {
        match self {
            Self::RunStarted => "run_started",
            Self::RunCompleted => "run_completed",
            Self::RunFailed => "run_failed",
            Self::AgentInvoked => "agent_invoked",
            Self::AgentCompleted => "agent_completed",
            Self::AgentError => "agent_error",
            Self::ToolCalled => "tool_called",
            Self::ToolResult => "tool_result",
            Self::CaseCreated => "case_created",
            Self::CaseUpdated => "case_updated",
            Self::CaseClosed => "case_closed",
            Self::MemoryQuery => "memory_query",
            Self::MemoryWrite => "memory_write",
            Self::PatternMatched => "pattern_matched",
            Self::HumanReviewRequested => "human_review_requested",
            Self::HumanFeedbackReceived => "human_feedback_received",
            Self::SystemMessage => "system_message",
            Self::Error => "error",
        }
    }

    pub fn from_wire(raw: &str) -> Option<Self> {
        let cleaned = raw.trim();
        Self::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(cleaned))
    }

    pub fn category(self) -> EventCategory {
        match self {
            Self::RunStarted | Self::RunCompleted | Self::RunFailed => EventCategory::Run,
            Self::AgentInvoked | Self::AgentCompleted | Self::AgentError => EventCategory::Agent,
            Self::ToolCalled | Self::ToolResult => EventCategory::Tool,
            Self::CaseCreated | Self::CaseUpdated | Self::CaseClosed => EventCategory::Case,
            Self::MemoryQuery | Self::MemoryWrite | Self::PatternMatched => EventCategory::Memory,
            Self::HumanReviewRequested | Self::HumanFeedbackReceived => EventCategory::Review,
            Self::SystemMessage | Self::Error => EventCategory::System,
        }
    }

    pub fn is_failure(self) -> bool {
        matches!(self, Self::RunFailed | Self::AgentError | Self::Error)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    Run,
    Agent,
    Tool,
    Case,
    Memory,
    Review,
    System,
}

impl EventCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Run => "run",
            Self::Agent => "agent",
            Self::Tool => "tool",
            Self::Case => "case",
            Self::Memory => "memory",
            Self::Review => "review",
            Self::System => "system",
        }
    }
}

/// Back-reference to an actor known to an external registry. Only the
/// identifier travels with the event; display data is looked up on demand.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct AgentRef(String);

impl AgentRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn id(&self) -> &str {
        &self.0
    }

    pub fn resolve<'r, R: AgentRegistry + ?Sized>(&self, registry: &'r R) -> Option<&'r AgentProfile> {
        registry.lookup(&self.0)
    }
}

impl fmt::Display for AgentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentProfile {
    pub id: String,
    pub display_name: String,
}

pub trait AgentRegistry {
    fn lookup(&self, id: &str) -> Option<&AgentProfile>;
}

#[derive(Debug, Clone, Default)]
pub struct AgentDirectory {
    agents: HashMap<String, AgentProfile>,
}

impl AgentDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: impl Into<String>, display_name: impl Into<String>) {
        let id = id.into();
        self.agents.insert(
            id.clone(),
            AgentProfile {
                id,
                display_name: display_name.into(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Display label for a reference, falling back to the raw id for agents
    /// the directory does not know.
    pub fn label<'a>(&'a self, agent: &'a AgentRef) -> &'a str {
        agent
            .resolve(self)
            .map(|profile| profile.display_name.as_str())
            .unwrap_or_else(|| agent.id())
    }
}

impl AgentRegistry for AgentDirectory {
    fn lookup(&self, id: &str) -> Option<&AgentProfile> {
        self.agents.get(id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimelineEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub case_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<AgentRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl TimelineEvent {
    pub fn category(&self) -> EventCategory {
        self.kind.category()
    }

    pub fn belongs_to_case(&self, case_id: &str) -> bool {
        self.case_id.as_deref() == Some(case_id)
    }
}
