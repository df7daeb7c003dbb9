use crate::connection::ConnectionState;
use casefeed_core::{FilterDescriptor, TimelineEvent};
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended { seq: u64, evicted: usize },
    Duplicate,
}

impl AppendOutcome {
    pub fn is_appended(self) -> bool {
        matches!(self, Self::Appended { .. })
    }
}

#[derive(Debug, Clone)]
pub struct TimelineSnapshot {
    revision: u64,
    first_seq: u64,
    events: Arc<[Arc<TimelineEvent>]>,
    filter: Option<FilterDescriptor>,
    auto_scroll: bool,
    connection_state: ConnectionState,
}

impl TimelineSnapshot {
    pub fn revision(&self) -> u64 {
        self.revision
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

    pub fn filter(&self) -> Option<&FilterDescriptor> {
        self.filter.as_ref()
    }

    pub fn auto_scroll(&self) -> bool {
        self.auto_scroll
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state == ConnectionState::Open
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection_state
    }

    pub fn first_seq(&self) -> u64 {
        self.first_seq
    }

    pub fn next_seq(&self) -> u64 {
        self.first_seq + self.events.len() as u64
    }

    pub fn latest(&self) -> Option<&TimelineEvent> {
        self.events.last().map(Arc::as_ref)
    }

    /// Events whose append sequence is `>= seq`, with their sequence numbers.
    /// Anything evicted before the call is simply absent.
    pub fn since(&self, seq: u64) -> impl Iterator<Item = (u64, &TimelineEvent)> + '_ {
        let skip = seq.saturating_sub(self.first_seq) as usize;
        self.events
            .iter()
            .enumerate()
            .skip(skip)
            .map(move |(index, event)| (self.first_seq + index as u64, event.as_ref()))
    }

    pub fn filtered(&self) -> impl Iterator<Item = &TimelineEvent> + Clone + '_ {
        let filter = self.filter.as_ref();
        self.events
            .iter()
            .map(Arc::as_ref)
            .filter(move |event| filter.map_or(true, |filter| filter.matches(event)))
    }
}

#[derive(Debug, Clone)]
pub struct FilteredEvents {
    snapshot: Arc<TimelineSnapshot>,
}

impl FilteredEvents {
    pub fn iter(&self) -> impl Iterator<Item = &TimelineEvent> + Clone + '_ {
        self.snapshot.filtered()
    }

    pub fn snapshot(&self) -> &Arc<TimelineSnapshot> {
        &self.snapshot
    }

    pub fn to_vec(&self) -> Vec<TimelineEvent> {
        self.iter().cloned().collect()
    }
}

struct StoreInner {
    capacity: usize,
    events: VecDeque<Arc<TimelineEvent>>,
    ids: HashSet<String>,
    first_seq: u64,
    published_events: Arc<[Arc<TimelineEvent>]>,
    events_dirty: bool,
    filter: Option<FilterDescriptor>,
    auto_scroll: bool,
    connection_state: ConnectionState,
    revision: u64,
}

impl StoreInner {
    fn snapshot(&mut self) -> TimelineSnapshot {
        // Rebuilt only when the events changed; O(capacity) pointer clones.
        if self.events_dirty {
            self.published_events = self.events.iter().cloned().collect();
            self.events_dirty = false;
        }
        TimelineSnapshot {
            revision: self.revision,
            first_seq: self.first_seq,
            events: self.published_events.clone(),
            filter: self.filter.clone(),
            auto_scroll: self.auto_scroll,
            connection_state: self.connection_state,
        }
    }
}

struct StoreShared {
    inner: Mutex<StoreInner>,
    tx: watch::Sender<Arc<TimelineSnapshot>>,
}

/// Snapshots are published while the mutex is held, so readers see
/// mutations in the order they were applied.
#[derive(Clone)]
pub struct TimelineStore {
    shared: Arc<StoreShared>,
}

impl TimelineStore {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let mut inner = StoreInner {
            capacity,
            events: VecDeque::with_capacity(capacity),
            ids: HashSet::with_capacity(capacity),
            first_seq: 1,
            published_events: Arc::from(Vec::new()),
            events_dirty: false,
            filter: None,
            auto_scroll: true,
            connection_state: ConnectionState::Idle,
            revision: 0,
        };
        let (tx, _) = watch::channel(Arc::new(inner.snapshot()));
        Self {
            shared: Arc::new(StoreShared {
                inner: Mutex::new(inner),
                tx,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.lock().capacity
    }

    pub fn append(&self, event: TimelineEvent) -> AppendOutcome {
        let mut inner = self.lock();
        if inner.ids.contains(&event.id) {
            debug!(event = "timeline_duplicate", id = %event.id);
            return AppendOutcome::Duplicate;
        }
        let seq = inner.first_seq + inner.events.len() as u64;
        inner.ids.insert(event.id.clone());
        inner.events.push_back(Arc::new(event));

        let mut evicted = 0;
        while inner.events.len() > inner.capacity {
            if let Some(oldest) = inner.events.pop_front() {
                inner.ids.remove(&oldest.id);
                inner.first_seq += 1;
                evicted += 1;
            }
        }
        inner.events_dirty = true;
        self.publish(&mut inner);
        AppendOutcome::Appended { seq, evicted }
    }

    pub fn clear(&self) {
        let mut inner = self.lock();
        if inner.events.is_empty() {
            return;
        }
        let cleared = inner.events.len() as u64;
        inner.first_seq += cleared;
        inner.events.clear();
        inner.ids.clear();
        inner.events_dirty = true;
        self.publish(&mut inner);
    }

    pub fn set_filter(&self, filter: Option<FilterDescriptor>) {
        let filter = filter.filter(|descriptor| !descriptor.is_empty());
        let mut inner = self.lock();
        if inner.filter == filter {
            return;
        }
        inner.filter = filter;
        self.publish(&mut inner);
    }

    pub fn set_auto_scroll(&self, auto_scroll: bool) {
        let mut inner = self.lock();
        if inner.auto_scroll == auto_scroll {
            return;
        }
        inner.auto_scroll = auto_scroll;
        self.publish(&mut inner);
    }

    // is_connected is derived: only Open counts
    pub(crate) fn set_connection_status(&self, state: ConnectionState) {
        let mut inner = self.lock();
        if inner.connection_state == state {
            return;
        }
        inner.connection_state = state;
        self.publish(&mut inner);
    }

    // Open -> Closing, anything else -> Idle
    pub(crate) fn begin_close(&self) -> ConnectionState {
        let mut inner = self.lock();
        let next = match inner.connection_state {
            ConnectionState::Open | ConnectionState::Closing => ConnectionState::Closing,
            _ => ConnectionState::Idle,
        };
        if inner.connection_state != next {
            inner.connection_state = next;
            self.publish(&mut inner);
        }
        next
    }

    pub(crate) fn finish_close(&self) -> bool {
        let mut inner = self.lock();
        if inner.connection_state != ConnectionState::Closing {
            return false;
        }
        inner.connection_state = ConnectionState::Idle;
        self.publish(&mut inner);
        true
    }

    pub fn snapshot(&self) -> Arc<TimelineSnapshot> {
        self.shared.tx.borrow().clone()
    }

    pub fn select_filtered(&self) -> FilteredEvents {
        FilteredEvents {
            snapshot: self.snapshot(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.shared.tx.borrow().is_connected()
    }

    pub fn filter(&self) -> Option<FilterDescriptor> {
        self.shared.tx.borrow().filter().cloned()
    }

    pub fn auto_scroll(&self) -> bool {
        self.shared.tx.borrow().auto_scroll()
    }

    pub fn len(&self) -> usize {
        self.shared.tx.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<TimelineSnapshot>> {
        self.shared.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.tx.receiver_count()
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.shared
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, inner: &mut StoreInner) {
        inner.revision += 1;
        let snapshot = Arc::new(inner.snapshot());
        self.shared.tx.send_replace(snapshot);
    }
}

impl std::fmt::Debug for TimelineStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.snapshot();
        f.debug_struct("TimelineStore")
            .field("revision", &snapshot.revision())
            .field("len", &snapshot.len())
            .field("is_connected", &snapshot.is_connected())
            .finish()
    }
}
