use crate::backoff::Backoff;
use crate::config::SyncConfig;
use crate::store::TimelineStore;
use crate::transport::{Inbound, Session, Transport, TransportError};
use crate::SyncError;
use casefeed_core::wire::{decode_frame, WireFrame};
use casefeed_core::normalize;
use chrono::Utc;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

const CLOSE_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Closing,
    Reconnecting,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Reconnecting => "reconnecting",
        }
    }
}

pub trait ConnectionControl: Send + Sync {
    /// Returns `false` when a session loop was already running.
    fn start(&self) -> bool;
    /// Returns `false` when nothing was running.
    fn stop(&self) -> bool;
    fn nudge(&self);
    fn is_running(&self) -> bool;
}

// Closed by stop() before shutdown is signalled; a winding-down loop
// never writes to the store again.
#[derive(Debug, Default)]
struct SessionGate {
    closed: Mutex<bool>,
}

impl SessionGate {
    fn apply<R>(&self, f: impl FnOnce() -> R) -> Option<R> {
        let closed = self.closed.lock().unwrap_or_else(PoisonError::into_inner);
        if *closed {
            None
        } else {
            Some(f())
        }
    }

    fn close(&self) {
        *self.closed.lock().unwrap_or_else(PoisonError::into_inner) = true;
    }
}

struct Worker {
    shutdown: watch::Sender<bool>,
    gate: Arc<SessionGate>,
    handle: JoinHandle<()>,
}

pub struct ConnectionManager<T: Transport> {
    config: SyncConfig,
    transport: Arc<T>,
    store: TimelineStore,
    runtime: Handle,
    nudge: Arc<Notify>,
    worker: Mutex<Option<Worker>>,
    retired: Mutex<Vec<JoinHandle<()>>>,
}

impl<T: Transport> ConnectionManager<T> {
    pub fn new(config: SyncConfig, transport: T, store: TimelineStore) -> Result<Self, SyncError> {
        let runtime = Handle::try_current().map_err(|_| SyncError::NoRuntime)?;
        Ok(Self::with_runtime(config, transport, store, runtime))
    }

    pub fn with_runtime(
        config: SyncConfig,
        transport: T,
        store: TimelineStore,
        runtime: Handle,
    ) -> Self {
        Self {
            config,
            transport: Arc::new(transport),
            store,
            runtime,
            nudge: Arc::new(Notify::new()),
            worker: Mutex::new(None),
            retired: Mutex::new(Vec::new()),
        }
    }

    pub fn store(&self) -> &TimelineStore {
        &self.store
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn state(&self) -> ConnectionState {
        self.store.snapshot().connection_state()
    }

    pub async fn wait_stopped(&self) {
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *lock(&self.retired));
        for handle in handles {
            if let Err(err) = handle.await {
                if err.is_panic() {
                    warn!(event = "connection_task_panicked", error = %err);
                }
            }
        }
        if lock(&self.worker).is_none() {
            self.store.finish_close();
        }
    }

    fn spawn_worker(&self) -> Worker {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let gate = Arc::new(SessionGate::default());
        let ctx = WorkerCtx {
            config: self.config.clone(),
            transport: self.transport.clone(),
            store: self.store.clone(),
            gate: gate.clone(),
            nudge: self.nudge.clone(),
            shutdown: shutdown_rx,
        };
        let handle = self.runtime.spawn(run_connection(ctx));
        Worker {
            shutdown,
            gate,
            handle,
        }
    }
}

impl<T: Transport> ConnectionControl for ConnectionManager<T> {
    fn start(&self) -> bool {
        let mut worker = lock(&self.worker);
        if worker.is_some() {
            return false;
        }
        info!(event = "connection_start", url = %self.config.url);
        *worker = Some(self.spawn_worker());
        true
    }

    fn stop(&self) -> bool {
        let Some(worker) = lock(&self.worker).take() else {
            return false;
        };
        worker.gate.close();
        let _ = worker.shutdown.send(true);
        let state = self.store.begin_close();
        info!(event = "connection_stop", url = %self.config.url, state = state.as_str());

        let mut retired = lock(&self.retired);
        retired.retain(|handle| !handle.is_finished());
        retired.push(worker.handle);
        true
    }

    fn nudge(&self) {
        if lock(&self.worker).is_some() {
            debug!(event = "connection_nudge");
            self.nudge.notify_waiters();
        }
    }

    fn is_running(&self) -> bool {
        lock(&self.worker).is_some()
    }
}

fn lock<V>(mutex: &Mutex<V>) -> MutexGuard<'_, V> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct WorkerCtx<T: Transport> {
    config: SyncConfig,
    transport: Arc<T>,
    store: TimelineStore,
    gate: Arc<SessionGate>,
    nudge: Arc<Notify>,
    shutdown: watch::Receiver<bool>,
}

impl<T: Transport> WorkerCtx<T> {
    fn set_state(&self, state: ConnectionState) {
        if self
            .gate
            .apply(|| self.store.set_connection_status(state))
            .is_some()
        {
            debug!(event = "connection_state", state = state.as_str());
        }
    }

    fn ingest(&self, text: &str) {
        let raw = match decode_frame(text, self.config.max_frame_bytes) {
            Ok(WireFrame::Pong) => return,
            Ok(WireFrame::Event(raw)) => raw,
            Err(err) => {
                warn!(event = "message_dropped", reason = %err);
                return;
            }
        };
        match normalize(raw, Utc::now()) {
            Ok(event) => {
                self.gate.apply(|| self.store.append(event));
            }
            Err(rejected) => warn!(event = "message_dropped", reason = %rejected),
        }
    }
}

#[derive(Debug)]
enum SessionEnd {
    Shutdown,
    Closed,
    HeartbeatTimeout(u32),
    Transport(TransportError),
}

impl SessionEnd {
    fn reason(&self) -> String {
        match self {
            Self::Shutdown => "shutdown".to_string(),
            Self::Closed => "closed by peer".to_string(),
            Self::HeartbeatTimeout(missed) => format!("{missed} heartbeats missed"),
            Self::Transport(err) => err.to_string(),
        }
    }
}

async fn wait_shutdown(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

async fn run_connection<T: Transport>(mut ctx: WorkerCtx<T>) {
    let mut backoff = Backoff::new(ctx.config.backoff.clone());

    loop {
        ctx.set_state(ConnectionState::Connecting);
        let timeout = ctx.config.connect_timeout;
        let connect = tokio::time::timeout(timeout, ctx.transport.connect());
        let outcome = tokio::select! {
            _ = wait_shutdown(&mut ctx.shutdown) => break,
            result = connect => result,
        };

        let failure = match outcome {
            Ok(Ok(mut session)) => {
                backoff.reset();
                ctx.set_state(ConnectionState::Open);
                info!(event = "connection_open", url = %ctx.config.url);

                let end = run_session(&mut ctx, &mut session).await;
                if matches!(end, SessionEnd::Shutdown) {
                    let _ = tokio::time::timeout(CLOSE_GRACE, session.close()).await;
                    break;
                }
                let _ = tokio::time::timeout(CLOSE_GRACE, session.close()).await;
                end.reason()
            }
            Ok(Err(err)) => {
                warn!(event = "connect_error", url = %ctx.config.url, error = %err);
                err.to_string()
            }
            Err(_) => {
                let err = TransportError::ConnectTimeout(timeout);
                warn!(event = "connect_error", url = %ctx.config.url, error = %err);
                err.to_string()
            }
        };

        ctx.set_state(ConnectionState::Reconnecting);
        let delay = backoff.next_delay();
        info!(
            event = "connection_retry",
            reason = %failure,
            attempt = backoff.attempt(),
            delay_ms = delay.as_millis() as u64
        );
        tokio::select! {
            _ = wait_shutdown(&mut ctx.shutdown) => break,
            _ = tokio::time::sleep(delay) => {}
            _ = ctx.nudge.notified() => {
                info!(event = "connection_retry_nudged");
            }
        }
    }

    if ctx.store.finish_close() {
        debug!(event = "connection_state", state = ConnectionState::Idle.as_str());
    }
    info!(event = "connection_stopped", url = %ctx.config.url);
}

async fn run_session<T: Transport>(ctx: &mut WorkerCtx<T>, session: &mut T::Session) -> SessionEnd {
    let period = ctx.config.heartbeat_interval;
    let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut missed = 0u32;

    loop {
        tokio::select! {
            _ = wait_shutdown(&mut ctx.shutdown) => return SessionEnd::Shutdown,
            inbound = session.recv() => match inbound {
                Some(Ok(Inbound::Text(text))) => {
                    missed = 0;
                    ctx.ingest(&text);
                }
                Some(Ok(Inbound::Pong)) => {
                    missed = 0;
                }
                Some(Err(err)) => return SessionEnd::Transport(err),
                None => return SessionEnd::Closed,
            },
            _ = heartbeat.tick() => {
                missed += 1;
                if missed >= ctx.config.max_missed_heartbeats {
                    warn!(event = "heartbeat_timeout", missed);
                    return SessionEnd::HeartbeatTimeout(missed);
                }
                tokio::select! {
                    _ = wait_shutdown(&mut ctx.shutdown) => return SessionEnd::Shutdown,
                    sent = tokio::time::timeout(period, session.send_ping()) => match sent {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => return SessionEnd::Transport(err),
                        Err(_) => {
                            let err = TransportError::SendTimeout(period);
                            warn!(event = "heartbeat_send_stalled", error = %err);
                            return SessionEnd::Transport(err);
                        }
                    },
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod scripted {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    pub(crate) enum Script {
        Fail,
        Hang,
        Open(mpsc::UnboundedReceiver<ScriptFrame>),
        // ping writes block forever
        StalledWrites(mpsc::UnboundedReceiver<ScriptFrame>),
    }

    #[derive(Debug)]
    pub(crate) enum ScriptFrame {
        Text(String),
        Pong,
        Error,
    }

    #[derive(Default)]
    pub(crate) struct ScriptedTransport {
        scripts: Mutex<VecDeque<Script>>,
        connects: Mutex<Vec<Instant>>,
        pings: Arc<AtomicUsize>,
    }

    impl ScriptedTransport {
        pub(crate) fn new(scripts: impl IntoIterator<Item = Script>) -> Self {
            Self {
                scripts: Mutex::new(scripts.into_iter().collect()),
                ..Self::default()
            }
        }

        pub(crate) fn connect_count(&self) -> usize {
            lock(&self.connects).len()
        }

        pub(crate) fn connect_times(&self) -> Vec<Instant> {
            lock(&self.connects).clone()
        }

        pub(crate) fn ping_count(&self) -> usize {
            self.pings.load(Ordering::SeqCst)
        }
    }

    impl Transport for ScriptedTransport {
        type Session = ScriptedSession;

        async fn connect(&self) -> Result<ScriptedSession, TransportError> {
            lock(&self.connects).push(Instant::now());
            let script = lock(&self.scripts).pop_front().unwrap_or(Script::Fail);
            match script {
                Script::Fail => Err(TransportError::Connect("refused".to_string())),
                Script::Hang => std::future::pending().await,
                Script::Open(rx) => Ok(ScriptedSession {
                    rx,
                    pings: self.pings.clone(),
                    stalled: false,
                }),
                Script::StalledWrites(rx) => Ok(ScriptedSession {
                    rx,
                    pings: self.pings.clone(),
                    stalled: true,
                }),
            }
        }
    }

    pub(crate) struct ScriptedSession {
        rx: mpsc::UnboundedReceiver<ScriptFrame>,
        pings: Arc<AtomicUsize>,
        stalled: bool,
    }

    impl Session for ScriptedSession {
        async fn recv(&mut self) -> Option<Result<Inbound, TransportError>> {
            match self.rx.recv().await? {
                ScriptFrame::Text(text) => Some(Ok(Inbound::Text(text))),
                ScriptFrame::Pong => Some(Ok(Inbound::Pong)),
                ScriptFrame::Error => Some(Err(TransportError::Receive("reset".to_string()))),
            }
        }

        async fn send_ping(&mut self) -> Result<(), TransportError> {
            self.pings.fetch_add(1, Ordering::SeqCst);
            if self.stalled {
                std::future::pending::<()>().await;
            }
            Ok(())
        }

        async fn close(&mut self) {
            self.rx.close();
        }
    }

    pub(crate) fn session() -> (mpsc::UnboundedSender<ScriptFrame>, Script) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Script::Open(rx))
    }

    pub(crate) fn stalled_session() -> (mpsc::UnboundedSender<ScriptFrame>, Script) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Script::StalledWrites(rx))
    }
}
