//! Settings persistence for the Universal Immersion Engine overlay.
//!
//! The host chat application owns the authoritative settings object but may
//! lose or reset it. This crate keeps a timestamped mirror of our bucket in a
//! fast local cache (falling back to a durable store), reconciles the host
//! copy against it on every read, partitions per-chat state, watches for wipes
//! and keeps a ring of backups.

pub mod accessor;
pub mod backup;
pub mod cli;
pub mod clock;
pub mod commands;
pub mod config;
pub mod document;
pub mod engine;
pub mod error;
pub mod events;
pub mod host;
pub mod layout;
pub mod logging;
pub mod mirror;
pub mod partition;
pub mod retry;
pub mod sanitize;
pub mod saved_states;
pub mod storage;
pub mod util;
pub mod watchdog;

pub use cli::run;
pub use engine::Engine;
pub use error::{Result, SettingsError};
