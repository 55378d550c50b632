//! Reacts to deletion events and periodically reconciles on-disk reality
//! with stored registry state.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::bus::{Event, EventBus};
use crate::error::{LifecycleError, RegistryError};
use crate::registry::Registry;
use crate::types::ReconcileResult;

/// The narrow interface a knowledge-graph client implements.
/// No production implementation lives in this crate — it is an external
/// collaborator — but the cleaner's public contract is unaffected whether
/// one is wired in or not.
pub trait GraphCollaborator: Send + Sync {
    fn delete_file_node(&self, path: &str) -> Result<(), String>;
    fn delete_directory_node(&self, path: &str) -> Result<(), String>;
    fn bulk_delete_file_nodes(&self, prefix: &str) -> Result<(), String>;
    fn bulk_delete_directory_nodes(&self, prefix: &str) -> Result<(), String>;
}

struct Lifecycle {
    started: bool,
    subscriber_task: Option<JoinHandle<()>>,
}

struct Inner {
    registry: Arc<Registry>,
    bus: Arc<EventBus>,
    graph: Option<Arc<dyn GraphCollaborator>>,
    lifecycle: Mutex<Lifecycle>,
    in_flight: AtomicU64,
    drained: Notify,
    stop_timeout: Duration,
    handler_deadline: Duration,
    bus_capacity: usize,
}

/// Owns the cleaner's subscription and in-flight handler bookkeeping.
/// Cheap to clone (wraps an `Arc`).
#[derive(Clone)]
pub struct Cleaner {
    inner: Arc<Inner>,
}

impl Cleaner {
    pub fn new(
        registry: Arc<Registry>,
        bus: Arc<EventBus>,
        graph: Option<Arc<dyn GraphCollaborator>>,
        stop_timeout: Duration,
        handler_deadline: Duration,
        bus_capacity: usize,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                bus,
                graph,
                lifecycle: Mutex::new(Lifecycle { started: false, subscriber_task: None }),
                in_flight: AtomicU64::new(0),
                drained: Notify::new(),
                stop_timeout,
                handler_deadline,
                bus_capacity,
            }),
        }
    }

    /// Subscribes to the bus and begins reacting to `PathDeleted` /
    /// `RememberedPathRemoved` / `ReconcileTick` events. Rejected with
    /// [`LifecycleError::AlreadyStarted`] if already running.
    pub fn start(&self) -> Result<(), LifecycleError> {
        let mut lifecycle = self.inner.lifecycle.lock();
        if lifecycle.started {
            return Err(LifecycleError::AlreadyStarted);
        }
        lifecycle.started = true;

        let inner = Arc::clone(&self.inner);
        let mut subscription = inner.bus.subscribe(inner.bus_capacity);
        let task = tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                let should_handle = {
                    let lifecycle = inner.lifecycle.lock();
                    if !lifecycle.started {
                        false
                    } else {
                        inner.in_flight.fetch_add(1, Ordering::SeqCst);
                        true
                    }
                };
                if !should_handle {
                    continue;
                }
                let inner = Arc::clone(&inner);
                tokio::spawn(async move {
                    Self::handle_event(&inner, event).await;
                    if inner.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
                        inner.drained.notify_waiters();
                    }
                });
            }
        });
        lifecycle.subscriber_task = Some(task);
        Ok(())
    }

    async fn handle_event(inner: &Arc<Inner>, event: Event) {
        let cleaner = Cleaner { inner: Arc::clone(inner) };
        let deadline = inner.handler_deadline;
        let outcome = tokio::time::timeout(deadline, async {
            match event {
                Event::PathDeleted { path } => cleaner.delete_path(&path),
                Event::RememberedPathRemoved(removed) => {
                    if !removed.keep_data {
                        cleaner.delete_path(&removed.path);
                    }
                }
                Event::ReconcileTick => {
                    // A bare tick carries no discovered-paths context; the
                    // supervisor is expected to invoke `reconcile` directly
                    // with a fresh walk's output instead of relying on this
                    // handler for anything but logging cadence.
                    debug!(component = "cleaner", "reconcile tick observed");
                }
                _ => {}
            }
        })
        .await;
        if outcome.is_err() {
            warn!(component = "cleaner", "handler exceeded deadline");
        }
    }

    /// Unsubscribes, then waits (bounded by the configured stop timeout,
    /// default 35s) for in-flight handlers to drain before returning.
    pub async fn stop(&self) {
        let task = {
            let mut lifecycle = self.inner.lifecycle.lock();
            lifecycle.started = false;
            lifecycle.subscriber_task.take()
        };
        if let Some(task) = task {
            task.abort();
        }

        let deadline = Instant::now() + self.inner.stop_timeout;
        loop {
            if self.inner.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!(component = "cleaner", "stop timed out with handlers still in flight");
                return;
            }
            let _ = tokio::time::timeout(remaining, self.inner.drained.notified()).await;
        }
    }

    pub fn is_started(&self) -> bool {
        self.inner.lifecycle.lock().started
    }

    pub fn in_flight(&self) -> u64 {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    /// Best-effort, idempotent, single-direction removal. Every step
    /// logs and swallows non-fatal errors; "not found" is debug-level, not
    /// an error, since both single-item and subtree deletion are always
    /// attempted regardless of whether `path` names a file or a directory.
    pub fn delete_path(&self, path: &str) {
        self.try_step("delete discovery row", self.inner.registry.delete_discovery(path));
        self.try_step(
            "bulk delete discovery subtree",
            self.inner.registry.bulk_delete_discovery_by_prefix(path),
        );
        self.try_step("delete file_state row", self.inner.registry.delete_file_state(path));
        self.try_step(
            "bulk delete file_state subtree",
            self.inner.registry.bulk_delete_file_state_by_prefix(path),
        );

        if let Some(graph) = &self.inner.graph {
            self.try_graph_step("graph delete file node", graph.delete_file_node(path));
            self.try_graph_step("graph delete directory node", graph.delete_directory_node(path));
            self.try_graph_step("graph bulk delete file nodes", graph.bulk_delete_file_nodes(path));
            self.try_graph_step(
                "graph bulk delete directory nodes",
                graph.bulk_delete_directory_nodes(path),
            );
        }
    }

    fn try_step<T>(&self, op: &'static str, result: Result<T, RegistryError>) {
        if let Err(e) = result {
            if e.is_not_found() {
                debug!(component = "cleaner", %op, "nothing to delete");
            } else {
                warn!(component = "cleaner", %op, error = %e, "delete_path step failed");
            }
        }
    }

    fn try_graph_step(&self, op: &'static str, result: Result<(), String>) {
        if let Err(error) = result {
            warn!(component = "cleaner", %op, %error, "graph delete_path step failed");
        }
    }

    /// Reconciles `file_state`/`discovery` rows under `parent_path` against
    /// `discovered_paths`, a fresh walk's live-path set. Checks
    /// `cancel` every 100 rows and stops early, returning a partial tally,
    /// if it fires.
    pub fn reconcile(
        &self,
        cancel: &tokio_util::sync::CancellationToken,
        parent_path: &str,
        discovered_paths: &HashSet<String>,
    ) -> Result<ReconcileResult, RegistryError> {
        let run_id = uuid::Uuid::new_v4();
        let start = Instant::now();
        let file_state_rows = self.inner.registry.list_file_state_by_prefix(parent_path)?;
        let discovery_rows = self.inner.registry.list_discovery_by_prefix(parent_path)?;
        let files_checked = file_state_rows.len() as i64;
        debug!(component = "cleaner", %run_id, %parent_path, files_checked, "reconcile starting");

        if discovered_paths.is_empty() && (!file_state_rows.is_empty() || !discovery_rows.is_empty()) {
            debug!(component = "cleaner", %run_id, "reconcile skipped: empty discovered set");
            return Ok(ReconcileResult {
                files_checked,
                stale_found: 0,
                stale_removed: 0,
                errors: 0,
                skipped: true,
                duration: start.elapsed(),
            });
        }

        let mut stale_found = 0i64;
        let mut stale_removed = 0i64;
        let mut errors = 0i64;
        let mut handled: HashSet<String> = HashSet::new();
        let mut checked = 0u64;

        for row in &file_state_rows {
            checked += 1;
            if checked % 100 == 0 && cancel.is_cancelled() {
                break;
            }
            if !discovered_paths.contains(&row.path) {
                stale_found += 1;
                self.delete_path(&row.path);
                handled.insert(row.path.clone());
                stale_removed += 1;
            }
        }

        for row in &discovery_rows {
            checked += 1;
            if checked % 100 == 0 && cancel.is_cancelled() {
                break;
            }
            if !discovered_paths.contains(&row.path) && !handled.contains(&row.path) {
                stale_found += 1;
                if let Err(e) = self.inner.registry.delete_discovery(&row.path) {
                    if !e.is_not_found() {
                        errors += 1;
                    }
                } else {
                    stale_removed += 1;
                }
            }
        }

        debug!(component = "cleaner", %run_id, stale_found, stale_removed, errors, "reconcile finished");
        Ok(ReconcileResult {
            files_checked,
            stale_found,
            stale_removed,
            errors,
            skipped: false,
            duration: start.elapsed(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;
    use tokio_util::sync::CancellationToken;

    fn cleaner() -> (Cleaner, Arc<Registry>) {
        let registry = Arc::new(Registry::open_in_memory().unwrap());
        let bus = Arc::new(EventBus::new());
        let cleaner = Cleaner::new(
            Arc::clone(&registry),
            bus,
            None,
            StdDuration::from_secs(35),
            StdDuration::from_secs(30),
            16,
        );
        (cleaner, registry)
    }

    #[test]
    fn delete_path_is_idempotent() {
        let (cleaner, registry) = cleaner();
        registry.update_metadata_state("/a/f.txt", "h", "m", 1, chrono::Utc::now()).unwrap();
        cleaner.delete_path("/a/f.txt");
        cleaner.delete_path("/a/f.txt");
        assert!(registry.get_file_state("/a/f.txt").unwrap().is_none());
    }

    #[test]
    fn reconcile_safeguard_skips_on_empty_discovered_set() {
        let (cleaner, registry) = cleaner();
        for i in 0..3 {
            registry
                .update_metadata_state(&format!("/root/f{i}.txt"), "h", "m", 1, chrono::Utc::now())
                .unwrap();
        }
        let cancel = CancellationToken::new();
        let result = cleaner.reconcile(&cancel, "/root", &HashSet::new()).unwrap();
        assert_eq!(result.files_checked, 3);
        assert_eq!(result.stale_removed, 0);
        assert!(result.skipped);
        assert_eq!(registry.count_file_state().unwrap(), 3);
    }

    #[test]
    fn reconcile_removes_rows_absent_from_discovered_set() {
        let (cleaner, registry) = cleaner();
        registry.update_metadata_state("/root/keep.txt", "h", "m", 1, chrono::Utc::now()).unwrap();
        registry.update_metadata_state("/root/stale.txt", "h", "m", 1, chrono::Utc::now()).unwrap();

        let mut discovered = HashSet::new();
        discovered.insert("/root/keep.txt".to_string());

        let cancel = CancellationToken::new();
        let result = cleaner.reconcile(&cancel, "/root", &discovered).unwrap();
        assert!(!result.skipped);
        assert_eq!(result.stale_found, 1);
        assert_eq!(result.stale_removed, 1);
        assert!(registry.get_file_state("/root/stale.txt").unwrap().is_none());
        assert!(registry.get_file_state("/root/keep.txt").unwrap().is_some());
    }

    #[tokio::test]
    async fn start_twice_fails_with_already_started() {
        let (cleaner, _registry) = cleaner();
        cleaner.start().unwrap();
        let err = cleaner.start().unwrap_err();
        assert_eq!(err, LifecycleError::AlreadyStarted);
        cleaner.stop().await;
    }

    #[tokio::test]
    async fn stop_waits_for_in_flight_handlers() {
        let (cleaner, _registry) = cleaner();
        cleaner.start().unwrap();
        cleaner.stop().await;
        assert!(!cleaner.is_started());
        assert_eq!(cleaner.in_flight(), 0);
    }
}
