//! Debounces and merges a noisy per-inode stream of raw filesystem
//! primitives into a deduplicated, correctly typed sequence of logical
//! changes.
//!
//! `pending[path]` holds at most one event with a scheduled timer. Every
//! transition stops the prior timer and arms a new one; timer fire
//! re-checks the map under its lock so a late-firing timer for an
//! already-emitted or already-superseded entry is a no-op.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// The three logical change kinds the coalescer both consumes and emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Create,
    Modify,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub path: String,
    pub kind: ChangeKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoalescedEvent {
    pub path: String,
    pub kind: ChangeKind,
}

struct Pending {
    kind: ChangeKind,
    /// Generation this entry was armed under, drawn from `Inner::next_generation`.
    /// A timer fired for a stale generation knows to do nothing even if the map
    /// still holds an entry for the path (the entry may since have been replaced
    /// by a newer transition, or even a later incarnation of the same path after
    /// a drop/emit) — since the counter is monotonic process-wide, no two
    /// incarnations of any path ever collide on the same generation.
    generation: u64,
}

struct Inner {
    pending: Mutex<HashMap<String, Pending>>,
    next_generation: AtomicU64,
    debounce: Duration,
    grace: Duration,
    output: mpsc::Sender<CoalescedEvent>,
}

/// Owns the pending-event map and the timers that drive it. Cheap to clone
/// (wraps an `Arc`); clones share the same pending state.
#[derive(Clone)]
pub struct Coalescer {
    inner: Arc<Inner>,
}

/// The receiving half paired with a [`Coalescer`] created by [`Coalescer::new`].
pub struct CoalescerOutput {
    pub receiver: mpsc::Receiver<CoalescedEvent>,
}

impl Coalescer {
    /// `debounce` governs Create/Modify timers; `grace` (typically longer,
    /// to absorb rename churn) governs Delete timers.
    pub fn new(debounce: Duration, grace: Duration, output_capacity: usize) -> (Self, CoalescerOutput) {
        let (sender, receiver) = mpsc::channel(output_capacity.max(1));
        let inner = Arc::new(Inner {
            pending: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(0),
            debounce,
            grace,
            output: sender,
        });
        (Self { inner }, CoalescerOutput { receiver })
    }

    /// Feeds one raw event through the transition table and
    /// (re)arms the path's timer. Non-blocking: timer scheduling happens on
    /// a spawned task, the map update itself is synchronous.
    pub fn add(&self, event: RawEvent) {
        let mut pending = self.inner.pending.lock();
        let entry = pending.get(&event.path).map(|p| p.kind);

        let (new_kind, drop_entry) = match (entry, event.kind) {
            (None, k) => (Some(k), false),
            (Some(ChangeKind::Create), ChangeKind::Modify) => (Some(ChangeKind::Create), false),
            (Some(ChangeKind::Create), ChangeKind::Delete) => (None, true),
            (Some(ChangeKind::Modify), ChangeKind::Modify) => (Some(ChangeKind::Modify), false),
            (Some(ChangeKind::Modify), ChangeKind::Delete) => (Some(ChangeKind::Delete), false),
            (Some(ChangeKind::Delete), ChangeKind::Create) => (Some(ChangeKind::Modify), false),
            (Some(ChangeKind::Delete), _) => (Some(ChangeKind::Delete), false),
            (Some(_), k) => (Some(k), false),
        };

        if drop_entry {
            pending.remove(&event.path);
            return;
        }

        let kind = new_kind.expect("non-drop transitions always produce a kind");
        let generation = self.inner.next_generation.fetch_add(1, Ordering::SeqCst);
        pending.insert(event.path.clone(), Pending { kind, generation });
        drop(pending);

        let delay = if kind == ChangeKind::Delete { self.inner.grace } else { self.inner.debounce };
        self.arm_timer(event.path, generation, delay);
    }

    fn arm_timer(&self, path: String, generation: u64, delay: Duration) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let emitted = {
                let mut pending = inner.pending.lock();
                match pending.get(&path) {
                    Some(p) if p.generation == generation => {
                        let kind = p.kind;
                        pending.remove(&path);
                        Some(CoalescedEvent { path: path.clone(), kind })
                    }
                    _ => None,
                }
            };
            if let Some(event) = emitted {
                let _ = inner.output.send(event).await;
            }
        })
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Drops the pending map without emitting and lets the output channel
    /// close when the last sender is dropped. Any in-flight timers become
    /// no-ops on fire since they re-check the (now-empty) map.
    pub fn stop(&self) {
        self.inner.pending.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    fn raw(path: &str, kind: ChangeKind) -> RawEvent {
        RawEvent { path: path.to_string(), kind }
    }

    #[tokio::test]
    async fn transient_file_yields_no_output() {
        let (c, mut out) = Coalescer::new(Duration::from_millis(50), Duration::from_millis(100), 8);
        c.add(raw("/a", ChangeKind::Create));
        tokio::time::sleep(StdDuration::from_millis(10)).await;
        c.add(raw("/a", ChangeKind::Delete));

        let result = tokio::time::timeout(StdDuration::from_millis(300), out.receiver.recv()).await;
        assert!(result.is_err(), "expected no event within the window");
        assert_eq!(c.pending_count(), 0);
    }

    #[tokio::test]
    async fn replace_yields_one_modify() {
        let (c, mut out) = Coalescer::new(Duration::from_millis(50), Duration::from_millis(100), 8);
        c.add(raw("/a", ChangeKind::Delete));
        tokio::time::sleep(StdDuration::from_millis(20)).await;
        c.add(raw("/a", ChangeKind::Create));

        let event = tokio::time::timeout(StdDuration::from_millis(150), out.receiver.recv())
            .await
            .expect("event within window")
            .expect("channel open");
        assert_eq!(event.path, "/a");
        assert_eq!(event.kind, ChangeKind::Modify);
    }

    #[tokio::test]
    async fn n_consecutive_modifies_yield_one_modify() {
        let (c, mut out) = Coalescer::new(Duration::from_millis(30), Duration::from_millis(80), 8);
        for _ in 0..5 {
            c.add(raw("/a", ChangeKind::Modify));
            tokio::time::sleep(StdDuration::from_millis(5)).await;
        }
        let event = tokio::time::timeout(StdDuration::from_millis(200), out.receiver.recv())
            .await
            .expect("event within window")
            .expect("channel open");
        assert_eq!(event.kind, ChangeKind::Modify);
        assert!(
            tokio::time::timeout(StdDuration::from_millis(100), out.receiver.recv()).await.is_err(),
            "only one event should be emitted"
        );
    }

    #[tokio::test]
    async fn create_then_modify_stays_create() {
        let (c, mut out) = Coalescer::new(Duration::from_millis(30), Duration::from_millis(80), 8);
        c.add(raw("/a", ChangeKind::Create));
        c.add(raw("/a", ChangeKind::Modify));
        let event = tokio::time::timeout(StdDuration::from_millis(200), out.receiver.recv())
            .await
            .expect("event within window")
            .expect("channel open");
        assert_eq!(event.kind, ChangeKind::Create);
    }

    #[tokio::test]
    async fn stop_clears_pending_without_emitting() {
        let (c, mut out) = Coalescer::new(Duration::from_millis(30), Duration::from_millis(80), 8);
        c.add(raw("/a", ChangeKind::Create));
        c.stop();
        assert_eq!(c.pending_count(), 0);
        assert!(tokio::time::timeout(StdDuration::from_millis(100), out.receiver.recv()).await.is_err());
    }
}
