use crate::store::TimelineSnapshot;
use casefeed_core::EventKind;
use std::collections::BTreeSet;

/// Kinds that change what the case list and stats endpoints return.
pub const CASE_AFFECTING_KINDS: [EventKind; 6] = [
    EventKind::CaseCreated,
    EventKind::CaseUpdated,
    EventKind::CaseClosed,
    EventKind::RunCompleted,
    EventKind::RunFailed,
    EventKind::AgentCompleted,
];

/// Cached queries that went stale since the last plan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvalidationPlan {
    pub case_lists: bool,
    pub stats: bool,
    pub cases: BTreeSet<String>,
}

impl InvalidationPlan {
    pub fn is_empty(&self) -> bool {
        !self.case_lists && !self.stats && self.cases.is_empty()
    }
}

/// Walks new events once each, by append sequence, and reports which
/// case-cache entries they invalidate.
#[derive(Debug, Clone, Default)]
pub struct InvalidationTracker {
    cursor: u64,
}

impl InvalidationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start after everything already in `snapshot`.
    pub fn starting_at(snapshot: &TimelineSnapshot) -> Self {
        Self {
            cursor: snapshot.next_seq(),
        }
    }

    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    pub fn plan(&mut self, snapshot: &TimelineSnapshot) -> InvalidationPlan {
        let mut plan = InvalidationPlan::default();
        for (_, event) in snapshot.since(self.cursor) {
            if !CASE_AFFECTING_KINDS.contains(&event.kind) {
                continue;
            }
            plan.case_lists = true;
            plan.stats = true;
            if let Some(case_id) = &event.case_id {
                plan.cases.insert(case_id.clone());
            }
        }
        self.cursor = self.cursor.max(snapshot.next_seq());
        plan
    }
}
