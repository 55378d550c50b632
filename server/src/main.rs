//! pathkeepd — the daemon binary.
//!
//! Opens the registry, assembles the bus/walker/cleaner/coalescer via
//! [`Supervisor`], installs a `notify` watcher on every remembered path,
//! bridges coalesced filesystem changes onto the bus, runs a full walk at
//! startup and a periodic incremental reconcile, then waits for `SIGINT`
//! and runs the shutdown sequence: stop watching, let the coalescer drain,
//! close the bus, stop the cleaner, drop the registry.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use clap::Parser;
use notify::{Event as NotifyEvent, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use pathkeep_core::bus::{Event, EventBus};
use pathkeep_core::coalescer::{ChangeKind, CoalescedEvent, Coalescer, RawEvent};
use pathkeep_core::cleaner::Cleaner;
use pathkeep_core::config::Config;
use pathkeep_core::hash::hash_file;
use pathkeep_core::registry::Registry;
use pathkeep_core::supervisor::Supervisor;
use pathkeep_core::types::{FileEvent, RememberedPathRemovedEvent};
use pathkeep_core::walker::Walker;

#[derive(Parser, Debug)]
#[command(name = "pathkeepd", version, about = "Watches remembered paths and maintains the derived file index")]
struct Cli {
    /// Override the registry database path (defaults to config / ~/.config/pathkeep/registry.db).
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Daemon config file (TOML). Missing file falls back to defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Tracing filter, e.g. "info" or "pathkeep_core=debug,pathkeepd=info".
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn default_config_path() -> PathBuf {
    dirs::config_dir().unwrap_or_else(|| PathBuf::from(".")).join("pathkeep").join("config.toml")
}

fn init_tracing(filter: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_new(filter)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let mut config = Config::load_or_default(&config_path).unwrap_or_default();
    if let Some(db_path) = cli.db_path.clone() {
        config.db_path = Some(db_path);
    }

    info!(
        component = "daemon",
        db_path = %config.resolved_db_path().display(),
        config_path = %config_path.display(),
        "starting pathkeepd",
    );

    let (supervisor, coalescer_output) = Supervisor::default_for(&config, None)?;
    supervisor.start()?;
    let handles = supervisor.handles();

    let remembered = handles.registry.list_paths()?;
    if remembered.is_empty() {
        warn!(component = "daemon", "no remembered paths; run `pathkeep remember <path>` to add one");
    }

    let (raw_tx, raw_rx) = mpsc::unbounded_channel::<RawEvent>();
    let watch_set = Arc::new(WatchSet::new(raw_tx));
    for r in &remembered {
        watch_set.watch(&r.path);
    }
    let feed_task = spawn_feed_task(raw_rx, handles.coalescer.clone());

    let cancel = CancellationToken::new();
    if let Err(e) = handles.walker.walk_all(&cancel).await {
        warn!(component = "daemon", error = %e, "startup walk failed");
    }
    run_reconcile(&handles, &cancel).await;

    let bridge_task = spawn_bridge_task(Arc::clone(&handles.registry), Arc::clone(&handles.bus), coalescer_output);
    let ticker_task =
        spawn_reconcile_ticker(handles.clone(), Arc::clone(&watch_set), config.reconcile_interval());

    tokio::signal::ctrl_c().await?;
    info!(component = "daemon", "shutdown signal received, draining");

    watch_set.stop_all();
    feed_task.abort();
    ticker_task.abort();
    supervisor.shutdown().await;
    bridge_task.abort();

    Ok(())
}

/// Every live `notify` watcher, keyed by the remembered path it covers.
/// Re-synced against the registry on every reconcile tick so a path
/// remembered or removed by a separate `pathkeep remember`/CLI process
/// without a daemon round-trip is picked up within one tick interval.
struct WatchSet {
    raw_tx: mpsc::UnboundedSender<RawEvent>,
    watchers: Mutex<HashMap<String, RecommendedWatcher>>,
}

impl WatchSet {
    fn new(raw_tx: mpsc::UnboundedSender<RawEvent>) -> Self {
        Self { raw_tx, watchers: Mutex::new(HashMap::new()) }
    }

    fn watch(&self, path: &str) -> bool {
        let tx = self.raw_tx.clone();
        let mut watcher = match notify::recommended_watcher(move |res: Result<NotifyEvent, notify::Error>| {
            let event = match res {
                Ok(e) => e,
                Err(e) => {
                    warn!(component = "daemon", error = %e, "watcher error");
                    return;
                }
            };
            let kind = match event.kind {
                EventKind::Create(_) => ChangeKind::Create,
                EventKind::Modify(_) => ChangeKind::Modify,
                EventKind::Remove(_) => ChangeKind::Delete,
                _ => return,
            };
            for path in event.paths {
                let _ = tx.send(RawEvent { path: path.to_string_lossy().to_string(), kind });
            }
        }) {
            Ok(w) => w,
            Err(e) => {
                warn!(component = "daemon", %path, error = %e, "failed to create watcher");
                return false;
            }
        };
        match watcher.watch(Path::new(path), RecursiveMode::Recursive) {
            Ok(()) => {
                info!(component = "daemon", %path, "watching");
                self.watchers.lock().insert(path.to_string(), watcher);
                true
            }
            Err(e) => {
                warn!(component = "daemon", %path, error = %e, "failed to watch path");
                false
            }
        }
    }

    fn unwatch(&self, path: &str) {
        self.watchers.lock().remove(path);
    }

    fn watched_paths(&self) -> HashSet<String> {
        self.watchers.lock().keys().cloned().collect()
    }

    fn stop_all(&self) {
        self.watchers.lock().clear();
    }
}

/// Brings the watch set in line with the registry: starts watching any
/// newly remembered path and stops watching any path no longer remembered,
/// publishing `RememberedPathAdded`/`RememberedPathRemoved` for each change
/// since those events otherwise only originate from the CLI's in-process
/// registry calls, which this daemon process never observes directly.
async fn sync_watchers(watch_set: &WatchSet, registry: &Registry, bus: &EventBus) {
    let remembered: HashSet<String> =
        registry.list_paths().unwrap_or_default().into_iter().map(|p| p.path).collect();
    let watched = watch_set.watched_paths();

    for path in remembered.difference(&watched) {
        if watch_set.watch(path) {
            let _ = bus.publish(Event::RememberedPathAdded { path: path.clone() }).await;
        }
    }
    for path in watched.difference(&remembered) {
        watch_set.unwatch(path);
        let _ = bus
            .publish(Event::RememberedPathRemoved(RememberedPathRemovedEvent {
                path: path.clone(),
                keep_data: false,
                reason: "path no longer remembered".to_string(),
            }))
            .await;
    }
}

/// Bridges the raw-event channel fed by every `notify` watcher into the
/// shared coalescer.
fn spawn_feed_task(mut raw_rx: mpsc::UnboundedReceiver<RawEvent>, coalescer: Coalescer) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = raw_rx.recv().await {
            coalescer.add(event);
        }
    })
}

/// Consumes coalesced changes and turns them into bus events:
/// `Delete` publishes `PathDeleted` for the cleaner to act on; `Create`/
/// `Modify` re-stat and re-hash the file, update the discovery row, clear
/// stale analysis state on a content-hash change, and
/// publish `FileChanged`/`FileModified`.
fn spawn_bridge_task(
    registry: Arc<Registry>,
    bus: Arc<EventBus>,
    mut output: pathkeep_core::coalescer::CoalescerOutput,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = output.receiver.recv().await {
            handle_coalesced(&registry, &bus, event).await;
        }
    })
}

async fn handle_coalesced(registry: &Arc<Registry>, bus: &Arc<EventBus>, event: CoalescedEvent) {
    match event.kind {
        ChangeKind::Delete => {
            let _ = bus.publish(Event::PathDeleted { path: event.path }).await;
        }
        ChangeKind::Create | ChangeKind::Modify => {
            let is_new = event.kind == ChangeKind::Create;
            let path_for_blocking = PathBuf::from(&event.path);
            let stat_result =
                tokio::task::spawn_blocking(move || stat_and_hash(&path_for_blocking)).await.ok().flatten();

            let Some((size, mod_time, content_hash)) = stat_result else {
                warn!(component = "daemon", path = %event.path, "failed to stat/hash changed file, skipping");
                return;
            };

            if let Ok(Some(prior)) = registry.get_file_state(&event.path) {
                if prior.content_hash.as_deref() != Some(content_hash.as_str()) {
                    if let Err(e) = registry.clear_analysis_state(&event.path) {
                        warn!(component = "daemon", path = %event.path, error = %e, "clear_analysis_state failed");
                    }
                }
            }
            if let Err(e) = registry.upsert_discovery(&event.path, &content_hash, size, mod_time) {
                warn!(component = "daemon", path = %event.path, error = %e, "upsert_discovery failed");
            }

            let file_event = FileEvent { path: event.path.clone(), content_hash, size, mod_time, is_new };
            let bus_event = if is_new { Event::FileChanged(file_event) } else { Event::FileModified(file_event) };
            let _ = bus.publish(bus_event).await;
        }
    }
}

fn stat_and_hash(path: &Path) -> Option<(i64, DateTime<Utc>, String)> {
    let meta = std::fs::metadata(path).ok()?;
    if !meta.is_file() {
        return None;
    }
    let size = meta.len() as i64;
    let mod_time = meta.modified().map(DateTime::<Utc>::from).unwrap_or_else(|_| Utc::now());
    let content_hash = hash_file(path).ok()?;
    Some((size, mod_time, content_hash))
}

/// Periodically re-syncs the watch set, re-walks every remembered path
/// incrementally, and reconciles registry state against the fresh
/// live-path set.
fn spawn_reconcile_ticker(
    handles: DaemonHandles,
    watch_set: Arc<WatchSet>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // first tick fires immediately; skip it, startup walk already ran
        loop {
            ticker.tick().await;
            sync_watchers(&watch_set, &handles.registry, &handles.bus).await;
            let _ = handles.bus.publish(Event::ReconcileTick).await;
            let cancel = CancellationToken::new();
            if let Err(e) = handles.walker.walk_all_incremental(&cancel).await {
                warn!(component = "daemon", error = %e, "periodic walk failed");
                continue;
            }
            run_reconcile(&handles, &cancel).await;
        }
    })
}

async fn run_reconcile(handles: &DaemonHandles, cancel: &CancellationToken) {
    let discovered = handles.walker.drain_discovered_paths();
    let by_parent = group_by_remembered_parent(&handles.registry, &discovered);
    for remembered in handles.registry.list_paths().unwrap_or_default() {
        let paths_for_parent = by_parent.get(&remembered.path).cloned().unwrap_or_default();
        match handles.cleaner.reconcile(cancel, &remembered.path, &paths_for_parent) {
            Ok(result) => {
                let _ = handles.bus.publish(Event::ReconcileCompleted(result)).await;
                info!(
                    component = "daemon",
                    path = %remembered.path,
                    files_checked = result.files_checked,
                    stale_removed = result.stale_removed,
                    skipped = result.skipped,
                    "reconcile complete",
                );
            }
            Err(e) => warn!(component = "daemon", path = %remembered.path, error = %e, "reconcile failed"),
        }
    }
}

fn group_by_remembered_parent(
    registry: &Registry,
    discovered: &HashSet<String>,
) -> HashMap<String, HashSet<String>> {
    let mut grouped: HashMap<String, HashSet<String>> = HashMap::new();
    for path in discovered {
        if let Ok(Some(remembered)) = registry.find_containing_path(Path::new(path)) {
            grouped.entry(remembered.path).or_default().insert(path.clone());
        }
    }
    grouped
}

/// Cloneable bundle of the handles the daemon's background tasks need,
/// kept separate from [`Supervisor`] itself since the supervisor is
/// consumed by value on shutdown.
#[derive(Clone)]
struct DaemonHandles {
    registry: Arc<Registry>,
    bus: Arc<EventBus>,
    walker: Arc<Walker>,
    cleaner: Cleaner,
    coalescer: Coalescer,
}

trait SupervisorHandlesExt {
    fn handles(&self) -> DaemonHandles;
}

impl SupervisorHandlesExt for Supervisor {
    fn handles(&self) -> DaemonHandles {
        DaemonHandles {
            registry: Arc::clone(self.registry()),
            bus: Arc::clone(self.bus()),
            walker: Arc::clone(self.walker()),
            cleaner: self.cleaner().clone(),
            coalescer: self.coalescer().clone(),
        }
    }
}
