//! Data model: remembered paths, path configuration, per-file discovery and
//! analysis state, the critical-event queue, and the small value types
//! (`PathStatus`, `SchemaMigration`) that round out the registry's rows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Tri-state override: unset defers to a parent/default, `on`/`off` pin the
/// value explicitly. Mirrors `PathConfig.use_vision`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriState {
    #[default]
    Unset,
    On,
    Off,
}

impl TriState {
    pub fn is_set(self) -> bool {
        !matches!(self, Self::Unset)
    }
}

/// Recognized per-path options. All fields optional unless noted;
/// `skip_hidden` defaults to `true`.
///
/// Deep-clone semantics: `Clone` is a full value clone, so a snapshot
/// returned by the registry never shares mutable state with the stored row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PathConfig {
    pub skip_hidden: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skip_extensions: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skip_directories: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skip_files: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include_extensions: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include_directories: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include_files: Vec<String>,
    #[serde(default, skip_serializing_if = "is_unset")]
    pub use_vision: TriState,

    /// Keys this process doesn't recognize, preserved verbatim across a
    /// read-modify-write cycle (DESIGN.md open question #2).
    #[serde(flatten)]
    pub unknown: BTreeMap<String, serde_json::Value>,
}

fn is_unset(t: &TriState) -> bool {
    matches!(t, TriState::Unset)
}

impl PathConfig {
    /// Effective `skip_hidden`, defaulting to `true` when unset.
    pub fn skip_hidden_effective(&self) -> bool {
        self.skip_hidden.unwrap_or(true)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

/// An absolute canonical directory registered for tracking.
#[derive(Debug, Clone, PartialEq)]
pub struct RememberedPath {
    pub id: i64,
    pub path: String,
    pub config: Option<PathConfig>,
    pub last_walk_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// "The last time we saw this file" — upserted by the walker on every
/// discovery, deleted when the file or its parent is removed.
#[derive(Debug, Clone, PartialEq)]
pub struct FileDiscovery {
    pub path: String,
    pub content_hash: String,
    pub size: i64,
    pub mod_time: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Per-file staged-analysis record. Invariants enforced by the
/// registry, never by the type itself:
/// - `semantic_analyzed_at.is_some() => metadata_analyzed_at.is_some()`
/// - `embeddings_analyzed_at.is_some() => semantic_analyzed_at.is_some()`
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FileState {
    pub path: String,
    pub content_hash: Option<String>,
    pub metadata_hash: Option<String>,
    pub size: Option<i64>,
    pub mod_time: Option<DateTime<Utc>>,

    pub metadata_analyzed_at: Option<DateTime<Utc>>,
    pub semantic_analyzed_at: Option<DateTime<Utc>>,
    pub embeddings_analyzed_at: Option<DateTime<Utc>>,
    /// Denormalized mirror of `semantic_analyzed_at`, set only on a
    /// successful semantic update (DESIGN.md open question #1).
    pub last_analyzed_at: Option<DateTime<Utc>>,
    pub analysis_version: Option<String>,

    pub semantic_error: Option<String>,
    pub semantic_retry_count: i64,
    pub embeddings_error: Option<String>,
    pub embeddings_retry_count: i64,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A durably queued record, bounded at capacity `C`. Overflow drops
/// the oldest row so the newest write always succeeds.
#[derive(Debug, Clone, PartialEq)]
pub struct CriticalEvent {
    pub id: i64,
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub payload: Vec<u8>,
}

/// Ephemeral health probe for a single remembered path.
#[derive(Debug, Clone, PartialEq)]
pub enum PathStatus {
    Ok,
    Missing,
    Denied { error: String },
    Error { error: String },
}

/// `(version, description, applied_at)`; migrations are append-only and run
/// in strictly increasing order.
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaMigration {
    pub version: i64,
    pub description: String,
    pub applied_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Event payloads — stable field names, these cross the bus boundary.
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEvent {
    pub path: String,
    pub content_hash: String,
    pub size: i64,
    pub mod_time: DateTime<Utc>,
    pub is_new: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RememberedPathRemovedEvent {
    pub path: String,
    pub keep_data: bool,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReconcileResult {
    pub files_checked: i64,
    pub stale_found: i64,
    pub stale_removed: i64,
    pub errors: i64,
    pub skipped: bool,
    pub duration: std::time::Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_config_round_trips_unknown_keys() {
        let json = r#"{"skip_hidden":false,"future_field":"keep-me","nested":{"a":1}}"#;
        let cfg = PathConfig::from_json(json).unwrap();
        assert_eq!(cfg.skip_hidden, Some(false));
        assert_eq!(cfg.unknown.get("future_field").unwrap(), "keep-me");

        let back = cfg.to_json().unwrap();
        let reparsed = PathConfig::from_json(&back).unwrap();
        assert_eq!(reparsed.unknown.get("future_field").unwrap(), "keep-me");
        assert_eq!(reparsed.unknown.get("nested").unwrap()["a"], 1);
    }

    #[test]
    fn path_config_omits_empty_fields() {
        let cfg = PathConfig::default();
        let json = cfg.to_json().unwrap();
        assert!(!json.contains("skip_extensions"));
        assert!(!json.contains("use_vision"));
    }

    #[test]
    fn skip_hidden_defaults_true() {
        let cfg = PathConfig::default();
        assert!(cfg.skip_hidden_effective());
        let explicit = PathConfig { skip_hidden: Some(false), ..Default::default() };
        assert!(!explicit.skip_hidden_effective());
    }
}
