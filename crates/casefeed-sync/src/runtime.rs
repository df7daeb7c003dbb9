use crate::config::{ConfigError, SyncConfig};
use crate::connection::{ConnectionControl, ConnectionManager, ConnectionState};
use crate::lifecycle::{InterestHandle, LifecycleCoordinator};
use crate::store::TimelineStore;
use crate::transport::{Transport, WsTransport};
use crate::view::{TimelineView, ViewPredicate};
use futures_util::future::BoxFuture;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("no tokio runtime in the current context")]
    NoRuntime,
    #[error("a timeline runtime is already installed")]
    AlreadyInstalled,
}

trait ManagedConnection: ConnectionControl {
    fn wait_stopped(&self) -> BoxFuture<'_, ()>;
}

impl<T: Transport> ManagedConnection for ConnectionManager<T> {
    fn wait_stopped(&self) -> BoxFuture<'_, ()> {
        Box::pin(ConnectionManager::wait_stopped(self))
    }
}

pub struct TimelineSync {
    config: SyncConfig,
    store: TimelineStore,
    coordinator: LifecycleCoordinator,
    connection: Arc<dyn ManagedConnection>,
}

impl TimelineSync {
    /// Nothing connects until the first [`acquire`](Self::acquire).
    pub fn init<T: Transport>(config: SyncConfig, transport: T) -> Result<Self, SyncError> {
        config.validate()?;
        let store = TimelineStore::new(config.capacity);
        let manager = Arc::new(ConnectionManager::new(
            config.clone(),
            transport,
            store.clone(),
        )?);
        let coordinator = LifecycleCoordinator::new(manager.clone());
        info!(
            event = "timeline_init",
            url = %config.url,
            capacity = config.capacity
        );
        Ok(Self {
            config,
            store,
            coordinator,
            connection: manager,
        })
    }

    pub fn connect(config: SyncConfig) -> Result<Self, SyncError> {
        let transport = WsTransport::new(config.url.clone());
        Self::init(config, transport)
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &TimelineStore {
        &self.store
    }

    pub fn coordinator(&self) -> &LifecycleCoordinator {
        &self.coordinator
    }

    pub fn acquire(&self) -> InterestHandle {
        self.coordinator.acquire()
    }

    pub fn view(&self, predicate: ViewPredicate) -> TimelineView {
        TimelineView::new(&self.store, predicate)
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.store.snapshot().connection_state()
    }

    pub fn is_running(&self) -> bool {
        self.connection.is_running()
    }

    /// Final. Outstanding handles stay valid but never reconnect.
    pub async fn shutdown(&self) {
        self.coordinator.shut_down();
        self.connection.wait_stopped().await;
        info!(event = "timeline_shutdown");
    }
}

impl fmt::Debug for TimelineSync {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimelineSync")
            .field("url", &self.config.url.as_str())
            .field("store", &self.store)
            .field("coordinator", &self.coordinator)
            .finish()
    }
}

static GLOBAL: Mutex<Option<Arc<TimelineSync>>> = Mutex::new(None);

pub fn install_global(sync: TimelineSync) -> Result<Arc<TimelineSync>, SyncError> {
    let mut slot = GLOBAL.lock().unwrap_or_else(PoisonError::into_inner);
    if slot.is_some() {
        return Err(SyncError::AlreadyInstalled);
    }
    let sync = Arc::new(sync);
    *slot = Some(sync.clone());
    Ok(sync)
}

pub fn global() -> Option<Arc<TimelineSync>> {
    GLOBAL
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

pub async fn shutdown_global() -> bool {
    let taken = GLOBAL
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take();
    match taken {
        Some(sync) => {
            sync.shutdown().await;
            true
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackoffConfig;
    use crate::connection::scripted::{session, Script, ScriptFrame, ScriptedTransport};
    use std::time::Duration;

    fn config() -> SyncConfig {
        SyncConfig {
            backoff: BackoffConfig {
                base: Duration::from_secs(1),
                cap: Duration::from_secs(30),
                jitter: 0.0,
            },
            ..SyncConfig::default()
        }
    }

    #[test]
    fn init_without_a_runtime_is_an_error() {
        let result = TimelineSync::init(config(), ScriptedTransport::default());
        assert!(matches!(result, Err(SyncError::NoRuntime)));
    }

    #[tokio::test]
    async fn init_rejects_invalid_config() {
        let mut bad = config();
        bad.capacity = 0;
        let result = TimelineSync::init(bad, ScriptedTransport::default());
        assert!(matches!(result, Err(SyncError::Config(ConfigError::Zero("capacity")))));
    }

    #[tokio::test(start_paused = true)]
    async fn consumers_share_the_store_and_shutdown_stops_reconnects() {
        let (tx, script) = session();
        let sync = TimelineSync::init(config(), ScriptedTransport::new(vec![script]))
            .expect("init");
        assert!(!sync.is_running());

        let kpi = sync.acquire();
        let strip = sync.acquire();
        let mut strip_view = sync.view(ViewPredicate::All);
        assert!(sync.is_running());

        tx.send(ScriptFrame::Text(
            r#"{"id":"e1","type":"case_created","message":"TW-1 opened","case_id":"TW-1"}"#
                .to_string(),
        ))
        .expect("send");
        let slice = loop {
            let slice = strip_view.changed().await.expect("store alive");
            if !slice.is_empty() {
                break slice;
            }
        };
        assert_eq!(slice.len(), 1);
        assert!(slice.is_connected());

        sync.shutdown().await;
        assert_eq!(sync.connection_state(), ConnectionState::Idle);
        assert!(!sync.is_running());
        drop(kpi);
        drop(strip);
        assert_eq!(sync.coordinator().interest_count(), 0);
        assert_eq!(sync.store().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn resume_after_shutdown_does_not_reconnect() {
        let sync = TimelineSync::init(config(), ScriptedTransport::default()).expect("init");
        let handle = sync.acquire();
        assert!(sync.is_running());

        sync.shutdown().await;
        sync.coordinator().resume();
        sync.coordinator().network_regained();
        let late = sync.acquire();
        assert!(!sync.is_running());

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(!sync.is_running());
        assert_eq!(sync.connection_state(), ConnectionState::Idle);
        drop(handle);
        drop(late);
    }

    #[tokio::test]
    async fn global_install_is_explicit_and_single() {
        assert!(global().is_none());
        let first = TimelineSync::init(config(), ScriptedTransport::default()).expect("init");
        let installed = install_global(first).expect("install");
        assert!(Arc::ptr_eq(&installed, &global().expect("installed")));

        let second = TimelineSync::init(config(), ScriptedTransport::default()).expect("init");
        assert!(matches!(install_global(second), Err(SyncError::AlreadyInstalled)));

        assert!(shutdown_global().await);
        assert!(global().is_none());
        assert!(!shutdown_global().await);
    }
}
