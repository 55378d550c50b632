//! Core daemon logic for pathkeep: the event bus, coalescer, walker/filter,
//! registry, and cleaner/reconciler that together maintain a derived file
//! index beneath a set of remembered directories.
//!
//! These five modules are deliberately coupled by one thing only: the
//! registry is ground truth for "what should exist", and every other
//! component reaches it through the narrow APIs below rather than through
//! shared mutable state. [`supervisor`] is the one place that wires them
//! together into a runnable daemon.

pub mod bus;
pub mod cleaner;
pub mod coalescer;
pub mod config;
pub mod error;
pub mod filter;
pub mod hash;
pub mod registry;
pub mod supervisor;
pub mod types;
pub mod walker;
