//! Typed error kinds shared by every core component.
//!
//! The taxonomy covers seven kinds: not-found, already-exists,
//! already-started, bus-closed, I/O/storage,
//! cancelled/deadline, and validation. Cancellation is modeled separately
//! (see [`crate::cancel`]) since it is cooperative and must never be logged
//! as an error at info+ levels.

use std::path::PathBuf;

/// Errors returned by [`crate::registry::Registry`] operations.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("{what} not found: {path}")]
    NotFound { what: &'static str, path: String },

    #[error("path already remembered: {path}")]
    AlreadyExists { path: String },

    #[error("{op}; {source}")]
    Io { op: &'static str, #[source] source: std::io::Error },

    #[error("{op}; {source}")]
    Sqlite { op: &'static str, #[source] source: rusqlite::Error },

    #[error("invalid input: {message}")]
    Validation { message: String },
}

impl RegistryError {
    pub fn not_found(what: &'static str, path: impl Into<String>) -> Self {
        Self::NotFound { what, path: path.into() }
    }

    pub fn sqlite(op: &'static str) -> impl FnOnce(rusqlite::Error) -> Self {
        move |source| Self::Sqlite { op, source }
    }

    pub fn io(op: &'static str) -> impl FnOnce(std::io::Error) -> Self {
        move |source| Self::Io { op, source }
    }

    /// True for errors that are safe to treat as idempotent success in
    /// cleanup paths.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl From<rusqlite::Error> for RegistryError {
    fn from(source: rusqlite::Error) -> Self {
        Self::Sqlite { op: "query", source }
    }
}

/// Errors returned by [`crate::bus::EventBus::publish`].
#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum BusError {
    #[error("event bus is closed")]
    Closed,
}

/// Errors returned by [`crate::cleaner::Cleaner::start`] /
/// [`crate::walker::Walker`] lifecycle misuse.
#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("already started")]
    AlreadyStarted,
}

/// Errors returned by walker operations.
#[derive(Debug, thiserror::Error)]
pub enum WalkError {
    #[error("{path} is not a directory")]
    NotADirectory { path: PathBuf },

    #[error("{path} has no remembered ancestor")]
    PathNotRemembered { path: PathBuf },

    #[error("{op}; {source}")]
    Io { op: &'static str, #[source] source: std::io::Error },

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("cancelled")]
    Cancelled,
}

/// Validation failures raised at command/config boundaries.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("invalid glob pattern {pattern:?}: {source}")]
    InvalidGlob { pattern: String, #[source] source: glob::PatternError },

    #[error("path must not be empty")]
    EmptyPath,
}
