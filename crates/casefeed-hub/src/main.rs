use axum::{
    extract::{ws::Message, ws::WebSocket, ws::WebSocketUpgrade, ConnectInfo, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use casefeed_core::wire::{DEFAULT_MAX_FRAME_BYTES, PING_FRAME, PONG_FRAME};
use casefeed_core::{encode_frame, normalize, EventKind, WireEvent};
use chrono::{DateTime, SecondsFormat, Utc};
use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Map, Value};
use std::{
    collections::HashMap,
    fs::OpenOptions,
    io::{self, Write},
    net::SocketAddr,
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};

const DEFAULT_ADDR: &str = "127.0.0.1:8000";
const WELCOME_MESSAGE: &str = "Connected to timeline stream";

#[derive(Clone, Debug)]
struct Config {
    addr: String,
    debug: bool,
    ping_interval: Duration,
    write_timeout: Duration,
    log_dir: String,
    demo_interval: Option<Duration>,
    max_frame_bytes: usize,
}

#[derive(Parser, Debug)]
#[command(name = "casefeed-hub", about = "Development hub serving the timeline stream")]
struct Args {
    #[arg(long, default_value = "")]
    addr: String,
    #[arg(long, default_value_t = false)]
    debug: bool,
    /// Seconds between websocket-level pings; 0 disables them.
    #[arg(long, default_value_t = 30)]
    ping_interval: u64,
    #[arg(long, default_value_t = 2)]
    write_timeout: u64,
    #[arg(long, default_value = "")]
    log_dir: String,
    /// Emit a synthetic run every N milliseconds; 0 disables it.
    #[arg(long, default_value_t = 0)]
    demo_interval_ms: u64,
    #[arg(long, default_value_t = DEFAULT_MAX_FRAME_BYTES)]
    max_frame_bytes: usize,
}

struct Client {
    conn_id: String,
    remote: SocketAddr,
    sender: mpsc::Sender<Message>,
}

impl Client {
    async fn send_text(&self, text: &str) -> bool {
        self.sender.send(Message::Text(text.to_string())).await.is_ok()
    }
}

struct HubState {
    config: Config,
    conn_counter: AtomicU64,
    broadcast_counter: AtomicU64,
    clients: RwLock<HashMap<String, Arc<Client>>>,
}

impl HubState {
    fn new(config: Config) -> Self {
        Self {
            config,
            conn_counter: AtomicU64::new(0),
            broadcast_counter: AtomicU64::new(0),
            clients: RwLock::new(HashMap::new()),
        }
    }

    fn next_conn_id(&self) -> String {
        let id = self.conn_counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("conn-{id}")
    }

    async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    async fn register_client(&self, client: Arc<Client>) {
        let total = {
            let mut clients = self.clients.write().await;
            clients.insert(client.conn_id.clone(), client.clone());
            clients.len()
        };
        info!(
            event = "client_connected",
            conn_id = %client.conn_id,
            remote = %client.remote,
            total
        );
    }

    async fn remove_client(&self, conn_id: &str, reason: &str) {
        let removed = self.clients.write().await.remove(conn_id);
        if removed.is_some() {
            let total = self.client_count().await;
            info!(
                event = "client_disconnected",
                conn_id = conn_id,
                reason = reason,
                total = total
            );
        }
    }

    async fn snapshot_clients(&self) -> Vec<Arc<Client>> {
        self.clients.read().await.values().cloned().collect()
    }

    /// Stamp, validate and fan out one event. Returns how many clients took it.
    async fn publish(&self, event: Value) -> Result<usize, PublishError> {
        let event = prepare_event(event, Utc::now())?;
        let text = encode_frame(&event, self.config.max_frame_bytes)
            .map_err(|err| PublishError::Invalid(err.to_string()))?;
        let delivered = self.broadcast(&text).await;
        let seq = self.broadcast_counter.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(event = "broadcast", seq, delivered);
        Ok(delivered)
    }

    async fn broadcast(&self, text: &str) -> usize {
        let mut delivered = 0;
        for client in self.snapshot_clients().await {
            if client.send_text(text).await {
                delivered += 1;
            } else {
                warn!(event = "send_error", conn_id = %client.conn_id);
                self.remove_client(&client.conn_id, "send_error").await;
            }
        }
        delivered
    }

    fn start_ping(self: Arc<Self>, client: Arc<Client>) {
        if self.config.ping_interval.is_zero() {
            return;
        }
        let interval = self.config.ping_interval;
        let hub = self.clone();
        let client = Arc::downgrade(&client);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(client) = client.upgrade() else {
                    return;
                };
                if client.sender.send(Message::Ping(Vec::new())).await.is_err() {
                    debug!(event = "ping_stopped", conn_id = %client.conn_id);
                    hub.remove_client(&client.conn_id, "ping_failed").await;
                    return;
                }
            }
        });
    }

    fn start_demo(self: Arc<Self>) {
        let Some(interval) = self.config.demo_interval else {
            return;
        };
        info!(event = "demo_start", interval_ms = interval.as_millis() as u64);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            let mut step: u64 = 0;
            loop {
                ticker.tick().await;
                if let Err(err) = self.publish(demo_event(step)).await {
                    warn!(event = "demo_error", error = %err);
                }
                step += 1;
            }
        });
    }

    async fn handle_socket(self: Arc<Self>, socket: WebSocket, remote: SocketAddr) {
        let (mut ws_sender, mut ws_receiver) = socket.split();
        let (tx, mut rx) = mpsc::channel::<Message>(256);
        let write_timeout = self.config.write_timeout;
        let write_task = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let send = ws_sender.send(msg);
                match tokio::time::timeout(write_timeout, send).await {
                    Ok(Ok(())) => {}
                    _ => return,
                }
            }
        });

        let client = Arc::new(Client {
            conn_id: self.next_conn_id(),
            remote,
            sender: tx.clone(),
        });
        match welcome_frame(Utc::now(), self.config.max_frame_bytes) {
            Ok(text) => {
                if !client.send_text(&text).await {
                    return;
                }
            }
            Err(err) => warn!(event = "welcome_error", error = %err),
        }
        self.register_client(client.clone()).await;
        self.clone().start_ping(client.clone());

        while let Some(result) = ws_receiver.next().await {
            let msg = match result {
                Ok(value) => value,
                Err(err) => {
                    warn!(event = "read_error", conn_id = %client.conn_id, error = %err);
                    break;
                }
            };
            let text = match msg {
                Message::Text(text) => text,
                Message::Binary(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                Message::Close(_) => {
                    info!(event = "client_close", conn_id = %client.conn_id);
                    break;
                }
                Message::Ping(_) | Message::Pong(_) => continue,
            };
            if text.trim() == PING_FRAME {
                if !client.send_text(PONG_FRAME).await {
                    break;
                }
                continue;
            }
            if self.config.debug {
                debug!(event = "message_ignored", conn_id = %client.conn_id, raw = %text);
            }
        }

        self.remove_client(&client.conn_id, "disconnect").await;
        drop(client);
        drop(tx);
        let _ = write_task.await;
    }
}

#[derive(Debug)]
enum PublishError {
    NotAnObject,
    Invalid(String),
}

impl std::fmt::Display for PublishError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotAnObject => f.write_str("event must be a JSON object"),
            Self::Invalid(reason) => write!(f, "invalid event: {reason}"),
        }
    }
}

/// Add a `timestamp` when the publisher left it out, then check that the
/// event would survive client-side normalization.
fn prepare_event(event: Value, now: DateTime<Utc>) -> Result<Value, PublishError> {
    let Value::Object(mut fields) = event else {
        return Err(PublishError::NotAnObject);
    };
    if !fields.contains_key("timestamp") {
        fields.insert(
            "timestamp".to_string(),
            Value::String(now.to_rfc3339_opts(SecondsFormat::Micros, true)),
        );
    }
    let event = Value::Object(fields);
    let raw: WireEvent = serde_json::from_value(event.clone())
        .map_err(|err| PublishError::Invalid(err.to_string()))?;
    normalize(raw, now).map_err(|err| PublishError::Invalid(err.to_string()))?;
    Ok(event)
}

fn welcome_frame(now: DateTime<Utc>, max_frame_bytes: usize) -> Result<String, casefeed_core::WireError> {
    let welcome = json!({
        "type": EventKind::SystemMessage.as_str(),
        "message": WELCOME_MESSAGE,
        "timestamp": now.to_rfc3339_opts(SecondsFormat::Micros, true),
    });
    encode_frame(&welcome, max_frame_bytes)
}

const DEMO_RUN: [(EventKind, &str, Option<&str>); 7] = [
    (EventKind::RunStarted, "Run started", None),
    (EventKind::AgentInvoked, "Triage agent invoked", Some("triage")),
    (EventKind::MemoryQuery, "Similar cases looked up", Some("triage")),
    (EventKind::ToolCalled, "Classifier called", Some("triage")),
    (EventKind::AgentCompleted, "Triage complete", Some("triage")),
    (EventKind::CaseUpdated, "Case classified", Some("resolver")),
    (EventKind::RunCompleted, "Run finished", None),
];

fn demo_event(step: u64) -> Value {
    let run = step / DEMO_RUN.len() as u64;
    let (kind, message, agent) = DEMO_RUN[(step % DEMO_RUN.len() as u64) as usize];
    let case_id = format!("DEMO-{:04}", run % 10_000);
    let mut fields = Map::new();
    fields.insert("id".to_string(), Value::String(format!("demo-{step}")));
    fields.insert("type".to_string(), Value::String(kind.as_str().to_string()));
    fields.insert("message".to_string(), Value::String(format!("{message} ({case_id})")));
    fields.insert("case_id".to_string(), Value::String(case_id));
    fields.insert("run_id".to_string(), Value::String(format!("run-demo-{run}")));
    if let Some(agent) = agent {
        fields.insert("agent".to_string(), Value::String(agent.to_string()));
    }
    Value::Object(fields)
}

#[tokio::main]
async fn main() {
    let config = load_config();
    let _log_guard = init_logging(&config);
    let addr: SocketAddr = match config.addr.parse() {
        Ok(value) => value,
        Err(err) => {
            error!(event = "invalid_addr", error = %err, addr = %config.addr);
            return;
        }
    };

    let hub = Arc::new(HubState::new(config.clone()));
    hub.clone().start_demo();

    let app = Router::new()
        .route("/ws/timeline", get(ws_handler))
        .route("/events", post(publish_handler))
        .route("/health", get(health_handler))
        .with_state(hub.clone());

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(value) => value,
        Err(err) => {
            error!(event = "hub_error", error = %err);
            return;
        }
    };

    info!(event = "hub_start", addr = %config.addr);

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    if let Err(err) = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    {
        error!(event = "hub_error", error = %err);
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(hub): State<Arc<HubState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        hub.handle_socket(socket, addr).await;
    })
}

async fn publish_handler(
    State(hub): State<Arc<HubState>>,
    Json(event): Json<Value>,
) -> impl IntoResponse {
    match hub.publish(event).await {
        Ok(delivered) => (
            StatusCode::ACCEPTED,
            Json(json!({ "status": "broadcast", "clients": delivered })),
        ),
        Err(err) => {
            warn!(event = "publish_rejected", error = %err);
            (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(json!({ "status": "rejected", "error": err.to_string() })),
            )
        }
    }
}

async fn health_handler(State(hub): State<Arc<HubState>>) -> impl IntoResponse {
    Json(json!({ "status": "ok", "clients": hub.client_count().await }))
}

fn load_config() -> Config {
    let args = Args::parse();
    let debug = args.debug || env_true("CASEFEED_HUB_DEBUG");
    Config {
        addr: resolve_addr(&args.addr),
        debug,
        ping_interval: Duration::from_secs(args.ping_interval),
        write_timeout: Duration::from_secs(args.write_timeout.max(1)),
        log_dir: resolve_log_dir(&args.log_dir),
        demo_interval: (args.demo_interval_ms > 0)
            .then(|| Duration::from_millis(args.demo_interval_ms)),
        max_frame_bytes: args.max_frame_bytes.max(1),
    }
}

fn init_logging(config: &Config) -> Option<LogGuard> {
    let level = if config.debug {
        "debug".to_string()
    } else if let Ok(level) = std::env::var("CASEFEED_LOG_LEVEL") {
        level
    } else {
        "info".to_string()
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let writer = match open_log_file(&config.log_dir) {
        Ok(log_guard) => log_guard,
        Err(err) => {
            eprintln!("log_file_error: {err}");
            LogGuard { file: None }
        }
    };
    let file = writer.file.clone();
    let make_writer = BoxMakeWriter::new(move || MultiWriter::new(file.clone()));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(make_writer)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return None;
    }
    Some(writer)
}

struct LogGuard {
    file: Option<Arc<Mutex<std::fs::File>>>,
}

struct MultiWriter {
    stdout: io::Stdout,
    file: Option<Arc<Mutex<std::fs::File>>>,
}

impl MultiWriter {
    fn new(file: Option<Arc<Mutex<std::fs::File>>>) -> Self {
        Self {
            stdout: io::stdout(),
            file,
        }
    }
}

impl Write for MultiWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = self.stdout.write_all(buf);
        if let Some(file) = &self.file {
            let mut file = file.lock().unwrap_or_else(PoisonError::into_inner);
            let _ = file.write_all(buf);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = self.stdout.flush();
        if let Some(file) = &self.file {
            let mut file = file.lock().unwrap_or_else(PoisonError::into_inner);
            let _ = file.flush();
        }
        Ok(())
    }
}

fn open_log_file(log_dir: &str) -> io::Result<LogGuard> {
    if log_dir.trim().is_empty() {
        return Ok(LogGuard { file: None });
    }
    let dir = PathBuf::from(log_dir);
    std::fs::create_dir_all(&dir)?;
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join("casefeed-hub.log"))?;
    Ok(LogGuard {
        file: Some(Arc::new(Mutex::new(file))),
    })
}

fn env_true(key: &str) -> bool {
    std::env::var(key).map(|value| parse_bool(&value)).unwrap_or(false)
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn resolve_addr(addr_flag: &str) -> String {
    if !addr_flag.trim().is_empty() {
        return addr_flag.to_string();
    }
    if let Ok(value) = std::env::var("CASEFEED_HUB_ADDR") {
        if !value.trim().is_empty() {
            return value;
        }
    }
    DEFAULT_ADDR.to_string()
}

fn resolve_log_dir(log_dir_flag: &str) -> String {
    if !log_dir_flag.trim().is_empty() {
        return log_dir_flag.to_string();
    }
    std::env::var("CASEFEED_LOG_DIR").unwrap_or_default()
}
