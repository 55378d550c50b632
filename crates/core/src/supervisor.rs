//! Minimal orchestrator: constructs the registry, bus, walker, coalescer,
//! and cleaner, wires the cleaner to the bus, and sequences graceful
//! shutdown.
//!
//! Construction is a single explicit value built from [`Config`] — no
//! process-wide registration, no global state.

use std::sync::Arc;

use crate::bus::EventBus;
use crate::cleaner::{Cleaner, GraphCollaborator};
use crate::coalescer::{Coalescer, CoalescerOutput};
use crate::config::Config;
use crate::error::RegistryError;
use crate::registry::Registry;
use crate::walker::Walker;

/// Everything a running daemon needs, assembled once at startup.
pub struct Supervisor {
    registry: Arc<Registry>,
    bus: Arc<EventBus>,
    walker: Arc<Walker>,
    cleaner: Cleaner,
    coalescer: Coalescer,
}

impl Supervisor {
    /// Builds the full component set from `config`. The external
    /// filesystem watcher is not constructed here — it is the daemon
    /// binary's responsibility to feed raw events into the returned
    /// [`Coalescer`] and read its [`CoalescerOutput`].
    pub fn default_for(config: &Config, graph: Option<Arc<dyn GraphCollaborator>>) -> Result<(Self, CoalescerOutput), RegistryError> {
        let registry =
            Arc::new(Registry::open(&config.resolved_db_path())?.with_queue_cap(config.critical_event_queue_cap));
        let bus = Arc::new(EventBus::new());
        let walker = Arc::new(Walker::new(
            Arc::clone(&registry),
            Arc::clone(&bus),
            config.walker_batch_size,
            config.walker_pace_interval(),
        ));
        let cleaner = Cleaner::new(
            Arc::clone(&registry),
            Arc::clone(&bus),
            graph,
            config.cleaner_stop_timeout(),
            config.cleaner_handler_deadline(),
            config.bus_subscriber_capacity,
        );
        let (coalescer, output) =
            Coalescer::new(config.coalescer_debounce(), config.coalescer_grace(), config.bus_subscriber_capacity);

        Ok((Self { registry, bus, walker, cleaner, coalescer }, output))
    }

    /// In-memory variant for tests that don't need a file-backed registry.
    pub fn default_for_in_memory(config: &Config, graph: Option<Arc<dyn GraphCollaborator>>) -> Result<(Self, CoalescerOutput), RegistryError> {
        let registry = Arc::new(Registry::open_in_memory()?.with_queue_cap(config.critical_event_queue_cap));
        let bus = Arc::new(EventBus::new());
        let walker = Arc::new(Walker::new(
            Arc::clone(&registry),
            Arc::clone(&bus),
            config.walker_batch_size,
            config.walker_pace_interval(),
        ));
        let cleaner = Cleaner::new(
            Arc::clone(&registry),
            Arc::clone(&bus),
            graph,
            config.cleaner_stop_timeout(),
            config.cleaner_handler_deadline(),
            config.bus_subscriber_capacity,
        );
        let (coalescer, output) =
            Coalescer::new(config.coalescer_debounce(), config.coalescer_grace(), config.bus_subscriber_capacity);

        Ok((Self { registry, bus, walker, cleaner, coalescer }, output))
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn walker(&self) -> &Arc<Walker> {
        &self.walker
    }

    pub fn cleaner(&self) -> &Cleaner {
        &self.cleaner
    }

    pub fn coalescer(&self) -> &Coalescer {
        &self.coalescer
    }

    /// Subscribes the cleaner to the bus. Must be called before the daemon
    /// starts delivering coalesced events onto it.
    pub fn start(&self) -> Result<(), crate::error::LifecycleError> {
        self.cleaner.start()
    }

    /// Graceful shutdown, in order: the caller closes the external watcher
    /// first (outside this crate), then this stops the coalescer so no
    /// further logical events are produced, closes the bus so no further
    /// publishes are accepted, stops the cleaner (draining in-flight
    /// handlers), and finally drops the registry handle.
    pub async fn shutdown(self) {
        self.coalescer.stop();
        self.bus.close();
        self.cleaner.stop().await;
        drop(self.registry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn default_for_in_memory_wires_components() {
        let (supervisor, _output) = Supervisor::default_for_in_memory(&Config::default(), None).unwrap();
        supervisor.start().unwrap();
        assert!(supervisor.cleaner().is_started());
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn start_twice_fails() {
        let (supervisor, _output) = Supervisor::default_for_in_memory(&Config::default(), None).unwrap();
        supervisor.start().unwrap();
        assert!(supervisor.start().is_err());
        supervisor.shutdown().await;
    }
}
