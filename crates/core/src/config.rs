//! Daemon-level settings: timer durations, pacing, and queue capacity. This
//! is the one config surface the core itself owns — everything about a
//! single remembered path lives in [`crate::types::PathConfig`] instead.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

fn default_debounce_ms() -> u64 {
    500
}

fn default_grace_ms() -> u64 {
    2_000
}

fn default_batch_size() -> usize {
    200
}

fn default_pace_interval_ms() -> u64 {
    0
}

fn default_queue_cap() -> i64 {
    100
}

fn default_cleaner_stop_timeout_secs() -> u64 {
    35
}

fn default_handler_deadline_secs() -> u64 {
    30
}

fn default_reconcile_interval_secs() -> u64 {
    300
}

fn default_bus_subscriber_capacity() -> usize {
    256
}

/// Top-level daemon configuration, typically loaded from
/// `~/.config/<app>/config.toml`. Every field has a sensible default so a
/// missing file (or missing keys within one) is never fatal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Where the registry's SQLite file lives.
    pub db_path: Option<PathBuf>,

    #[serde(default = "default_debounce_ms")]
    pub coalescer_debounce_ms: u64,
    #[serde(default = "default_grace_ms")]
    pub coalescer_grace_ms: u64,

    #[serde(default = "default_batch_size")]
    pub walker_batch_size: usize,
    #[serde(default = "default_pace_interval_ms")]
    pub walker_pace_interval_ms: u64,

    #[serde(default = "default_queue_cap")]
    pub critical_event_queue_cap: i64,

    #[serde(default = "default_cleaner_stop_timeout_secs")]
    pub cleaner_stop_timeout_secs: u64,
    #[serde(default = "default_handler_deadline_secs")]
    pub cleaner_handler_deadline_secs: u64,
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,

    #[serde(default = "default_bus_subscriber_capacity")]
    pub bus_subscriber_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: None,
            coalescer_debounce_ms: default_debounce_ms(),
            coalescer_grace_ms: default_grace_ms(),
            walker_batch_size: default_batch_size(),
            walker_pace_interval_ms: default_pace_interval_ms(),
            critical_event_queue_cap: default_queue_cap(),
            cleaner_stop_timeout_secs: default_cleaner_stop_timeout_secs(),
            cleaner_handler_deadline_secs: default_handler_deadline_secs(),
            reconcile_interval_secs: default_reconcile_interval_secs(),
            bus_subscriber_capacity: default_bus_subscriber_capacity(),
        }
    }
}

impl Config {
    pub fn from_toml_str(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    pub fn to_toml_string(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    pub fn load_or_default(path: &std::path::Path) -> std::io::Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(raw) => Ok(Self::from_toml_str(&raw).unwrap_or_default()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e),
        }
    }

    pub fn coalescer_debounce(&self) -> Duration {
        Duration::from_millis(self.coalescer_debounce_ms)
    }

    pub fn coalescer_grace(&self) -> Duration {
        Duration::from_millis(self.coalescer_grace_ms)
    }

    pub fn walker_pace_interval(&self) -> Duration {
        Duration::from_millis(self.walker_pace_interval_ms)
    }

    pub fn cleaner_stop_timeout(&self) -> Duration {
        Duration::from_secs(self.cleaner_stop_timeout_secs)
    }

    pub fn cleaner_handler_deadline(&self) -> Duration {
        Duration::from_secs(self.cleaner_handler_deadline_secs)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    /// Default database location, `~/.config/pathkeep/registry.db`, used
    /// when `db_path` is unset.
    pub fn resolved_db_path(&self) -> PathBuf {
        self.db_path.clone().unwrap_or_else(|| {
            dirs_next_config_dir().join("pathkeep").join("registry.db")
        })
    }
}

fn dirs_next_config_dir() -> PathBuf {
    std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))
        .unwrap_or_else(|| PathBuf::from("."))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_values() {
        let cfg = Config::default();
        assert_eq!(cfg.critical_event_queue_cap, 100);
        assert_eq!(cfg.cleaner_stop_timeout_secs, 35);
        assert_eq!(cfg.cleaner_handler_deadline_secs, 30);
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let cfg = Config::from_toml_str("coalescer_debounce_ms = 750\n").unwrap();
        assert_eq!(cfg.coalescer_debounce_ms, 750);
        assert_eq!(cfg.critical_event_queue_cap, 100);
    }

    #[test]
    fn round_trips_through_toml() {
        let cfg = Config { db_path: Some(PathBuf::from("/tmp/x.db")), ..Default::default() };
        let s = cfg.to_toml_string().unwrap();
        let back = Config::from_toml_str(&s).unwrap();
        assert_eq!(cfg, back);
    }

    #[test]
    fn missing_file_yields_default() {
        let cfg = Config::load_or_default(std::path::Path::new("/nonexistent/path/config.toml")).unwrap();
        assert_eq!(cfg, Config::default());
    }
}
