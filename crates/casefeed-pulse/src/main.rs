use casefeed_core::{AgentDirectory, EventCategory, EventKind, FilterDescriptor, TimelineEvent};
use casefeed_sync::config::parse_url;
use casefeed_sync::{
    install_global, shutdown_global, ConnectionState, InvalidationTracker, SyncConfig,
    TimelineSync, ViewPredicate, ViewSlice,
};
use clap::Parser;
use std::collections::{BTreeMap, BTreeSet};
use std::error::Error;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_STRIP_LEN: usize = 8;

#[derive(Parser, Debug)]
#[command(name = "casefeed-pulse", about = "Follow the live case timeline from a terminal")]
struct Args {
    /// Timeline websocket URL; overrides CASEFEED_URL.
    #[arg(long)]
    url: Option<String>,
    /// Also mount the detail feed for this case.
    #[arg(long)]
    case: Option<String>,
    /// Initial text filter for the live strip.
    #[arg(long)]
    filter: Option<String>,
    /// Restrict the live strip to these kinds (repeatable).
    #[arg(long = "kind")]
    kinds: Vec<String>,
    /// Display name for an agent id, as `id=Name` (repeatable).
    #[arg(long = "agent", value_parser = parse_agent_label)]
    agents: Vec<(String, String)>,
    #[arg(long, default_value_t = DEFAULT_STRIP_LEN)]
    strip_len: usize,
}

struct Config {
    sync: SyncConfig,
    case_id: Option<String>,
    filter: Option<FilterDescriptor>,
    agents: AgentDirectory,
    strip_len: usize,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let config = load_config()?;
    init_logging();

    let sync = install_global(TimelineSync::connect(config.sync.clone())?)?;
    if config.filter.is_some() {
        sync.store().set_filter(config.filter.clone());
    }
    let agents = Arc::new(config.agents);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut consumers = vec![
        tokio::spawn(kpi_deck(sync.clone(), shutdown_rx.clone())),
        tokio::spawn(live_strip(
            sync.clone(),
            agents.clone(),
            config.strip_len.max(1),
            shutdown_rx.clone(),
        )),
        tokio::spawn(cache_invalidation(sync.clone(), shutdown_rx.clone())),
    ];
    if let Some(case_id) = config.case_id {
        consumers.push(tokio::spawn(case_detail(
            sync.clone(),
            case_id,
            agents.clone(),
            shutdown_rx.clone(),
        )));
    }
    let commands = tokio::spawn(command_loop(sync.clone()));

    tokio::signal::ctrl_c().await?;
    info!(event = "pulse_shutdown");
    let _ = shutdown_tx.send(true);
    for consumer in consumers {
        let _ = consumer.await;
    }
    commands.abort();
    shutdown_global().await;
    Ok(())
}

fn load_config() -> Result<Config, Box<dyn Error>> {
    let args = Args::parse();
    let mut sync = SyncConfig::from_env()?;
    if let Some(url) = args.url.as_deref() {
        sync.url = parse_url(url)?;
    }

    let mut filter = FilterDescriptor::default();
    if let Some(text) = args.filter.filter(|text| !text.trim().is_empty()) {
        filter.text = Some(text);
    }
    if !args.kinds.is_empty() {
        let kinds = args
            .kinds
            .iter()
            .map(|raw| EventKind::from_wire(raw).ok_or_else(|| format!("unknown event kind '{raw}'")))
            .collect::<Result<BTreeSet<_>, _>>()?;
        filter.kinds = Some(kinds);
    }

    let mut agents = AgentDirectory::new();
    for (id, name) in args.agents {
        agents.insert(id, name);
    }

    Ok(Config {
        sync,
        case_id: args.case.filter(|case| !case.trim().is_empty()),
        filter: (!filter.is_empty()).then_some(filter),
        agents,
        strip_len: args.strip_len,
    })
}

fn parse_agent_label(value: &str) -> Result<(String, String), String> {
    match value.split_once('=') {
        Some((id, name)) if !id.trim().is_empty() && !name.trim().is_empty() => {
            Ok((id.trim().to_string(), name.trim().to_string()))
        }
        _ => Err(format!("expected id=Name, got '{value}'")),
    }
}

fn parse_bool_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let enabled = std::env::var("CASEFEED_LOG_STDOUT")
        .ok()
        .and_then(|value| parse_bool_flag(&value))
        .unwrap_or(false);
    if enabled {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(io::stderr)
            .try_init();
    } else {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(io::sink)
            .try_init();
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct KpiSummary {
    connection: ConnectionState,
    total: usize,
    by_category: BTreeMap<EventCategory, usize>,
    failures: usize,
    cases: usize,
}

impl KpiSummary {
    fn from_slice(slice: &ViewSlice) -> Self {
        let mut by_category = BTreeMap::new();
        let mut failures = 0;
        let mut cases = BTreeSet::new();
        for event in slice.events() {
            *by_category.entry(event.category()).or_insert(0) += 1;
            if event.kind.is_failure() {
                failures += 1;
            }
            if let Some(case_id) = event.case_id.as_deref() {
                cases.insert(case_id);
            }
        }
        Self {
            connection: slice.snapshot().connection_state(),
            total: slice.len(),
            by_category,
            failures,
            cases: cases.len(),
        }
    }

    fn render(&self) -> String {
        let categories = self
            .by_category
            .iter()
            .map(|(category, count)| format!("{} {count}", category.as_str()))
            .collect::<Vec<_>>()
            .join(" ");
        format!(
            "[{}] {} events | {} | failures {} | cases {}",
            self.connection.as_str(),
            self.total,
            if categories.is_empty() { "-" } else { categories.as_str() },
            self.failures,
            self.cases
        )
    }
}

fn format_event(event: &TimelineEvent, agents: &AgentDirectory) -> String {
    let mut line = format!(
        "{} {:<24}",
        event.timestamp.format("%H:%M:%S"),
        event.kind.as_str()
    );
    if let Some(case_id) = &event.case_id {
        line.push_str(&format!(" {case_id}"));
    }
    if let Some(agent) = &event.agent {
        line.push_str(&format!(" @{}", agents.label(agent)));
    }
    line.push_str(&format!(" {}", event.message));
    line
}

/// Newest `limit` events appended at or after `cursor`.
fn fresh_items(slice: &ViewSlice, cursor: u64, limit: usize) -> Vec<&TimelineEvent> {
    let fresh: Vec<&TimelineEvent> = slice.since(cursor).map(|(_, event)| event).collect();
    let skip = fresh.len().saturating_sub(limit);
    fresh.into_iter().skip(skip).collect()
}

async fn kpi_deck(sync: Arc<TimelineSync>, mut shutdown: watch::Receiver<bool>) {
    let _interest = sync.acquire();
    let mut view = sync.view(ViewPredicate::All).respect_store_filter(false);
    let mut slice = view.current_and_mark_seen();
    let mut last: Option<KpiSummary> = None;
    loop {
        let summary = KpiSummary::from_slice(&slice);
        if last.as_ref() != Some(&summary) {
            println!("{}", summary.render());
            last = Some(summary);
        }
        tokio::select! {
            _ = shutdown.changed() => break,
            next = view.changed() => match next {
                Some(next) => slice = next,
                None => break,
            },
        }
    }
}

async fn live_strip(
    sync: Arc<TimelineSync>,
    agents: Arc<AgentDirectory>,
    strip_len: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    let _interest = sync.acquire();
    let mut view = sync.view(ViewPredicate::All);
    let mut slice = view.current_and_mark_seen();
    let mut cursor = 0;
    let mut connection = slice.snapshot().connection_state();
    loop {
        let state = slice.snapshot().connection_state();
        if state != connection {
            println!("-- {} --", state.as_str());
            connection = state;
        }
        // paused auto-scroll holds new items back until it is switched on
        if slice.snapshot().auto_scroll() {
            for event in fresh_items(&slice, cursor, strip_len) {
                println!("  {}", format_event(event, &agents));
            }
            cursor = slice.snapshot().next_seq();
        }
        tokio::select! {
            _ = shutdown.changed() => break,
            next = view.changed() => match next {
                Some(next) => slice = next,
                None => break,
            },
        }
    }
}

async fn case_detail(
    sync: Arc<TimelineSync>,
    case_id: String,
    agents: Arc<AgentDirectory>,
    mut shutdown: watch::Receiver<bool>,
) {
    let _interest = sync.acquire();
    let mut view = sync
        .view(ViewPredicate::Case(case_id.clone()))
        .respect_store_filter(false);
    let mut slice = view.current_and_mark_seen();
    let mut cursor = 0;
    loop {
        let fresh = fresh_items(&slice, cursor, usize::MAX);
        if !fresh.is_empty() {
            println!("== {case_id}: {} events ==", slice.len());
            for event in fresh {
                println!("  {}", format_event(event, &agents));
            }
        }
        cursor = slice.snapshot().next_seq();
        tokio::select! {
            _ = shutdown.changed() => break,
            next = view.changed() => match next {
                Some(next) => slice = next,
                None => break,
            },
        }
    }
}

/// Reports which cached case queries a persistent cache would refetch.
/// Watches the store without holding interest of its own.
async fn cache_invalidation(sync: Arc<TimelineSync>, mut shutdown: watch::Receiver<bool>) {
    let mut view = sync.view(ViewPredicate::All).respect_store_filter(false);
    let mut tracker = InvalidationTracker::starting_at(view.current_and_mark_seen().snapshot());
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            next = view.changed() => match next {
                Some(slice) => {
                    let plan = tracker.plan(slice.snapshot());
                    if !plan.is_empty() {
                        info!(
                            event = "cache_invalidated",
                            case_lists = plan.case_lists,
                            stats = plan.stats,
                            cases = ?plan.cases
                        );
                    }
                }
                None => break,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Pause,
    Resume,
    Retry,
    Clear,
    Filter(Option<String>),
    AutoScroll(bool),
}

fn parse_command(line: &str) -> Option<Command> {
    let line = line.trim();
    let (head, rest) = line.split_once(' ').unwrap_or((line, ""));
    let rest = rest.trim();
    match head {
        "p" | "pause" => Some(Command::Pause),
        "r" | "resume" => Some(Command::Resume),
        "retry" => Some(Command::Retry),
        "clear" => Some(Command::Clear),
        "f" | "filter" => Some(Command::Filter((!rest.is_empty()).then(|| rest.to_string()))),
        "scroll" => parse_bool_flag(rest).map(Command::AutoScroll),
        _ => None,
    }
}

/// Swap only the text needle; kinds and case set at startup stay.
fn with_text_filter(
    current: Option<FilterDescriptor>,
    text: Option<String>,
) -> Option<FilterDescriptor> {
    let mut filter = current.unwrap_or_default();
    filter.text = text;
    (!filter.is_empty()).then_some(filter)
}

async fn command_loop(sync: Arc<TimelineSync>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => return,
            Err(err) => {
                warn!(event = "stdin_error", error = %err);
                return;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let Some(command) = parse_command(&line) else {
            eprintln!("commands: pause | resume | retry | clear | filter [text] | scroll on|off");
            continue;
        };
        info!(event = "pulse_command", command = ?command);
        match command {
            Command::Pause => sync.coordinator().suspend(),
            Command::Resume => sync.coordinator().resume(),
            Command::Retry => sync.coordinator().network_regained(),
            Command::Clear => sync.store().clear(),
            Command::Filter(text) => {
                let filter = with_text_filter(sync.store().filter(), text);
                sync.store().set_filter(filter);
            }
            Command::AutoScroll(enabled) => sync.store().set_auto_scroll(enabled),
        }
    }
}
