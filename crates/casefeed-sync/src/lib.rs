pub mod backoff;
pub mod config;
pub mod connection;
pub mod invalidation;
pub mod lifecycle;
pub mod runtime;
pub mod store;
pub mod transport;
pub mod view;

#[cfg(test)]
mod test_support;

pub use backoff::Backoff;
pub use config::{BackoffConfig, ConfigError, SyncConfig};
pub use connection::{ConnectionControl, ConnectionManager, ConnectionState};
pub use invalidation::{InvalidationPlan, InvalidationTracker, CASE_AFFECTING_KINDS};
pub use lifecycle::{InterestHandle, LifecycleCoordinator};
pub use runtime::{global, install_global, shutdown_global, SyncError, TimelineSync};
pub use store::{AppendOutcome, FilteredEvents, TimelineSnapshot, TimelineStore};
pub use transport::{Inbound, Session, Transport, TransportError, WsSession, WsTransport};
pub use view::{TimelineView, ViewPredicate, ViewSlice};
