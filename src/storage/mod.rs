//! Storage tiers underneath the mirror.
//!
//! - [`LocalStorage`] is the fast, synchronous, size-limited string store
//!   ([`FastLocalCache`] keeps one timestamped snapshot in it).
//! - [`DurableStore`] is the asynchronous record store used as fallback and
//!   as the home of the backup ring.

mod durable;
mod local;

pub use durable::{DurableStore, FileDurableStore, MemoryDurableStore};
pub use local::{FastLocalCache, FileStorage, LocalStorage, MemoryStorage, MirrorSnapshot};
