//! Full and incremental directory traversal against per-path include/skip
//! rules. A walk publishes `FileDiscovered` onto the bus for every
//! new-or-changed file and records the session's discovered set for later
//! reconciliation.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use ignore::WalkBuilder;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::bus::{Event, EventBus};
use crate::error::WalkError;
use crate::filter::Filter;
use crate::hash::hash_file;
use crate::registry::Registry;
use crate::types::FileEvent;

#[derive(Debug, Clone, Default)]
pub struct WalkStats {
    pub files_discovered: u64,
    pub files_skipped: u64,
    pub files_unchanged: u64,
    pub dirs_traversed: u64,
    pub last_walk_path: Option<String>,
    pub last_walk_time: Option<DateTime<Utc>>,
    pub is_walking: bool,
}

/// Traverses remembered paths and maintains the live-path set. Shares a
/// registry and bus with the rest of the daemon via `Arc`.
pub struct Walker {
    registry: Arc<Registry>,
    bus: Arc<EventBus>,
    stats: Mutex<WalkStats>,
    discovered: Mutex<HashSet<String>>,
    batch_size: usize,
    pace_interval: Duration,
}

impl Walker {
    pub fn new(registry: Arc<Registry>, bus: Arc<EventBus>, batch_size: usize, pace_interval: Duration) -> Self {
        Self {
            registry,
            bus,
            stats: Mutex::new(WalkStats::default()),
            discovered: Mutex::new(HashSet::new()),
            batch_size: batch_size.max(1),
            pace_interval,
        }
    }

    pub fn stats(&self) -> WalkStats {
        self.stats.lock().clone()
    }

    /// Returns and clears the session's discovered-paths set. At-most-once
    /// per walk: a second call before the next walk returns an empty set.
    pub fn drain_discovered_paths(&self) -> HashSet<String> {
        std::mem::take(&mut *self.discovered.lock())
    }

    pub async fn walk(&self, cancel: &CancellationToken, path: &Path) -> Result<(), WalkError> {
        self.walk_tree(cancel, path, false).await
    }

    pub async fn walk_incremental(&self, cancel: &CancellationToken, path: &Path) -> Result<(), WalkError> {
        self.walk_tree(cancel, path, true).await
    }

    pub async fn walk_all(&self, cancel: &CancellationToken) -> Result<(), WalkError> {
        for remembered in self.registry.list_paths()? {
            if cancel.is_cancelled() {
                return Err(WalkError::Cancelled);
            }
            self.walk(cancel, Path::new(&remembered.path)).await?;
        }
        Ok(())
    }

    pub async fn walk_all_incremental(&self, cancel: &CancellationToken) -> Result<(), WalkError> {
        for remembered in self.registry.list_paths()? {
            if cancel.is_cancelled() {
                return Err(WalkError::Cancelled);
            }
            self.walk_incremental(cancel, Path::new(&remembered.path)).await?;
        }
        Ok(())
    }

    async fn walk_tree(&self, cancel: &CancellationToken, path: &Path, incremental: bool) -> Result<(), WalkError> {
        let walk_id = uuid::Uuid::new_v4();
        let root = crate::registry::normalize_path(path);
        let meta = std::fs::metadata(&root).map_err(|e| WalkError::Io { op: "stat root", source: e })?;
        if !meta.is_dir() {
            return Err(WalkError::NotADirectory { path: root });
        }
        let remembered = self
            .registry
            .find_containing_path(&root)?
            .ok_or_else(|| WalkError::PathNotRemembered { path: root.clone() })?;
        let config = remembered.config.clone().unwrap_or_default();
        let filter = Filter::from_config(&config);

        tracing::debug!(component = "walker", %walk_id, path = %root.display(), incremental, "walk starting");
        {
            let mut stats = self.stats.lock();
            stats.is_walking = true;
        }

        let registry = Arc::clone(&self.registry);
        let bus = Arc::clone(&self.bus);
        let cancel = cancel.clone();
        let batch_size = self.batch_size;
        let pace_interval = self.pace_interval;
        let root_for_blocking = root.clone();
        let filter_for_blocking = filter.clone();

        let outcome = tokio::task::spawn_blocking(move || {
            Self::walk_blocking(&registry, &bus, &cancel, &root_for_blocking, &filter_for_blocking, incremental, batch_size, pace_interval)
        })
        .await
        .expect("walker blocking task never panics")?;

        {
            let mut stats = self.stats.lock();
            stats.files_discovered += outcome.discovered.len() as u64;
            stats.files_skipped += outcome.skipped;
            stats.files_unchanged += outcome.unchanged;
            stats.dirs_traversed += outcome.dirs_traversed;
            stats.last_walk_path = Some(root.to_string_lossy().to_string());
            stats.last_walk_time = Some(Utc::now());
            stats.is_walking = false;
        }
        tracing::debug!(
            component = "walker", %walk_id, discovered = outcome.discovered.len(),
            skipped = outcome.skipped, unchanged = outcome.unchanged, "walk finished",
        );
        self.discovered.lock().extend(outcome.discovered);

        self.registry.update_path_last_walk(&root, Utc::now())?;
        Ok(())
    }

    fn walk_blocking(
        registry: &Registry,
        bus: &Arc<EventBus>,
        cancel: &CancellationToken,
        root: &Path,
        filter: &Filter,
        incremental: bool,
        batch_size: usize,
        pace_interval: Duration,
    ) -> Result<WalkOutcome, WalkError> {
        let mut outcome = WalkOutcome::default();
        let filter_for_dirs = filter.clone();

        let walk = WalkBuilder::new(root)
            .standard_filters(false)
            .follow_links(false)
            .filter_entry(move |entry| {
                if entry.depth() == 0 {
                    return true;
                }
                match entry.file_type() {
                    Some(ft) if ft.is_dir() => {
                        let name = entry.file_name().to_string_lossy();
                        filter_for_dirs.should_process_dir(&name)
                    }
                    _ => true,
                }
            })
            .build();

        let mut since_pace = 0usize;
        for entry in walk {
            if cancel.is_cancelled() {
                return Err(WalkError::Cancelled);
            }
            let entry = match entry {
                Ok(e) => e,
                Err(_) => {
                    outcome.skipped += 1;
                    continue;
                }
            };
            if entry.depth() == 0 {
                continue;
            }
            let file_type = match entry.file_type() {
                Some(ft) => ft,
                None => continue,
            };
            if file_type.is_symlink() {
                continue;
            }
            if file_type.is_dir() {
                outcome.dirs_traversed += 1;
                continue;
            }

            let name = entry.file_name().to_string_lossy().to_string();
            let ext = Path::new(&name).extension().map(|e| e.to_string_lossy().to_string()).unwrap_or_default();
            if !filter.should_process_file(&name, &ext) {
                outcome.skipped += 1;
                continue;
            }

            let path = entry.path().to_path_buf();
            let path_str = path.to_string_lossy().to_string();
            outcome.discovered.insert(path_str.clone());

            let meta = match std::fs::metadata(&path) {
                Ok(m) => m,
                Err(_) => {
                    outcome.skipped += 1;
                    continue;
                }
            };
            let size = meta.len() as i64;
            let mod_time: DateTime<Utc> = meta.modified().map(DateTime::<Utc>::from).unwrap_or_else(|_| Utc::now());

            if incremental {
                if let Ok(Some(state)) = registry.get_file_state(&path_str) {
                    if state.size == Some(size) && state.mod_time == Some(mod_time) {
                        outcome.unchanged += 1;
                        continue;
                    }
                }
            }

            let content_hash = match hash_file(&path) {
                Ok(h) => h,
                Err(_) => {
                    outcome.skipped += 1;
                    continue;
                }
            };

            let is_new = registry.get_discovery(&path_str).ok().flatten().is_none();
            if registry.upsert_discovery(&path_str, &content_hash, size, mod_time).is_err() {
                outcome.skipped += 1;
                continue;
            }

            let event = Event::FileDiscovered(FileEvent {
                path: path_str,
                content_hash,
                size,
                mod_time,
                is_new,
            });
            let _ = futures_block_on_publish(bus, event);

            since_pace += 1;
            if since_pace >= batch_size && !pace_interval.is_zero() {
                std::thread::sleep(pace_interval);
                since_pace = 0;
            }
        }

        Ok(outcome)
    }
}

/// Bridges the synchronous walk loop (running inside `spawn_blocking`) to
/// the async bus without requiring a full runtime handle per call; bus
/// publishes are cheap sends to already-open channels so blocking briefly
/// on them from a blocking-pool thread is acceptable.
fn futures_block_on_publish(bus: &Arc<EventBus>, event: Event) -> Result<(), crate::error::BusError> {
    tokio::runtime::Handle::current().block_on(bus.publish(event))
}

#[derive(Default)]
struct WalkOutcome {
    discovered: HashSet<String>,
    skipped: u64,
    unchanged: u64,
    dirs_traversed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PathConfig;
    use std::fs;

    fn setup() -> (Arc<Registry>, Arc<EventBus>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(Registry::open_in_memory().unwrap());
        let bus = Arc::new(EventBus::new());
        (registry, bus, dir)
    }

    #[tokio::test]
    async fn walk_applies_include_exclude_precedence() {
        let (registry, bus, dir) = setup();
        let root = dir.path().join("root");
        fs::create_dir_all(root.join(".hidden")).unwrap();
        fs::write(root.join("a.txt"), b"a").unwrap();
        fs::write(root.join("b.log"), b"b").unwrap();
        fs::write(root.join("important.log"), b"c").unwrap();
        fs::write(root.join(".hidden/x.txt"), b"d").unwrap();

        let config = PathConfig {
            skip_extensions: vec![".log".into()],
            include_files: vec!["important.log".into()],
            skip_hidden: Some(true),
            ..Default::default()
        };
        registry.add_path(&root, Some(config)).unwrap();

        let walker = Walker::new(Arc::clone(&registry), Arc::clone(&bus), 200, Duration::ZERO);
        let cancel = CancellationToken::new();
        walker.walk(&cancel, &root).await.unwrap();

        let discovered = walker.drain_discovered_paths();
        let expected: HashSet<String> = [
            root.join("a.txt").to_string_lossy().to_string(),
            root.join("important.log").to_string_lossy().to_string(),
        ]
        .into_iter()
        .collect();
        assert_eq!(discovered, expected);
    }

    #[tokio::test]
    async fn walk_fails_when_path_not_remembered() {
        let (registry, bus, dir) = setup();
        let walker = Walker::new(registry, bus, 200, Duration::ZERO);
        let cancel = CancellationToken::new();
        let err = walker.walk(&cancel, dir.path()).await.unwrap_err();
        assert!(matches!(err, WalkError::PathNotRemembered { .. }));
    }

    #[tokio::test]
    async fn incremental_walk_skips_unchanged_files() {
        let (registry, bus, dir) = setup();
        let root = dir.path().join("root");
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join("a.txt"), b"a").unwrap();
        registry.add_path(&root, None).unwrap();

        let walker = Walker::new(Arc::clone(&registry), Arc::clone(&bus), 200, Duration::ZERO);
        let cancel = CancellationToken::new();
        walker.walk(&cancel, &root).await.unwrap();
        walker.drain_discovered_paths();

        walker.walk_incremental(&cancel, &root).await.unwrap();
        assert_eq!(walker.stats().files_unchanged, 1);
    }

    #[tokio::test]
    async fn drain_discovered_paths_is_at_most_once() {
        let (registry, bus, dir) = setup();
        let root = dir.path().join("root");
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join("a.txt"), b"a").unwrap();
        registry.add_path(&root, None).unwrap();

        let walker = Walker::new(registry, bus, 200, Duration::ZERO);
        let cancel = CancellationToken::new();
        walker.walk(&cancel, &root).await.unwrap();
        assert_eq!(walker.drain_discovered_paths().len(), 1);
        assert_eq!(walker.drain_discovered_paths().len(), 0);
    }
}
