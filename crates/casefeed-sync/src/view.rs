use crate::store::{TimelineSnapshot, TimelineStore};
use casefeed_core::{EventKind, TimelineEvent};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Clone)]
pub enum ViewPredicate {
    All,
    Case(String),
    Kinds(BTreeSet<EventKind>),
    Custom(Arc<dyn Fn(&TimelineEvent) -> bool + Send + Sync>),
}

impl ViewPredicate {
    pub fn kinds(kinds: impl IntoIterator<Item = EventKind>) -> Self {
        Self::Kinds(kinds.into_iter().collect())
    }

    pub fn custom<F>(predicate: F) -> Self
    where
        F: Fn(&TimelineEvent) -> bool + Send + Sync + 'static,
    {
        Self::Custom(Arc::new(predicate))
    }

    pub fn matches(&self, event: &TimelineEvent) -> bool {
        match self {
            Self::All => true,
            Self::Case(case_id) => event.belongs_to_case(case_id),
            Self::Kinds(kinds) => kinds.contains(&event.kind),
            Self::Custom(predicate) => predicate(event),
        }
    }
}

impl fmt::Debug for ViewPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str("All"),
            Self::Case(case_id) => f.debug_tuple("Case").field(case_id).finish(),
            Self::Kinds(kinds) => f.debug_tuple("Kinds").field(kinds).finish(),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ViewSlice {
    snapshot: Arc<TimelineSnapshot>,
    seqs: Vec<u64>,
    events: Vec<Arc<TimelineEvent>>,
}

impl ViewSlice {
    pub fn snapshot(&self) -> &Arc<TimelineSnapshot> {
        &self.snapshot
    }

    pub fn revision(&self) -> u64 {
        self.snapshot.revision()
    }

    pub fn events(&self) -> &[Arc<TimelineEvent>] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn latest(&self) -> Option<&TimelineEvent> {
        self.events.last().map(Arc::as_ref)
    }

    pub fn is_connected(&self) -> bool {
        self.snapshot.is_connected()
    }

    /// Projected events appended at or after `seq`.
    pub fn since(&self, seq: u64) -> impl Iterator<Item = (u64, &TimelineEvent)> + '_ {
        let start = self.seqs.partition_point(|&candidate| candidate < seq);
        self.seqs[start..]
            .iter()
            .copied()
            .zip(self.events[start..].iter().map(Arc::as_ref))
    }

    pub fn tail(&self, n: usize) -> &[Arc<TimelineEvent>] {
        let start = self.events.len().saturating_sub(n);
        &self.events[start..]
    }
}

/// Registered with the store for as long as it lives.
pub struct TimelineView {
    rx: watch::Receiver<Arc<TimelineSnapshot>>,
    predicate: ViewPredicate,
    respect_store_filter: bool,
}

impl TimelineView {
    pub fn new(store: &TimelineStore, predicate: ViewPredicate) -> Self {
        Self {
            rx: store.subscribe(),
            predicate,
            respect_store_filter: true,
        }
    }

    pub fn respect_store_filter(mut self, respect: bool) -> Self {
        self.respect_store_filter = respect;
        self
    }

    pub fn predicate(&self) -> &ViewPredicate {
        &self.predicate
    }

    pub fn current(&self) -> ViewSlice {
        let snapshot = self.rx.borrow().clone();
        self.project(snapshot)
    }

    pub fn current_and_mark_seen(&mut self) -> ViewSlice {
        let snapshot = self.rx.borrow_and_update().clone();
        self.project(snapshot)
    }

    /// Wait for the next publish and project it. Returns `None` once the
    /// store is gone.
    pub async fn changed(&mut self) -> Option<ViewSlice> {
        self.rx.changed().await.ok()?;
        Some(self.current_and_mark_seen())
    }

    pub fn has_changed(&self) -> bool {
        self.rx.has_changed().unwrap_or(false)
    }

    fn project(&self, snapshot: Arc<TimelineSnapshot>) -> ViewSlice {
        let store_filter = if self.respect_store_filter {
            snapshot.filter()
        } else {
            None
        };
        let first_seq = snapshot.first_seq();
        let (seqs, events) = snapshot
            .events()
            .iter()
            .enumerate()
            .filter(|(_, event)| store_filter.map_or(true, |filter| filter.matches(event)))
            .filter(|(_, event)| self.predicate.matches(event))
            .map(|(index, event)| (first_seq + index as u64, event.clone()))
            .unzip();
        ViewSlice {
            snapshot,
            seqs,
            events,
        }
    }
}

impl fmt::Debug for TimelineView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimelineView")
            .field("predicate", &self.predicate)
            .field("respect_store_filter", &self.respect_store_filter)
            .finish()
    }
}
