//! Storage backends for `http-cache-core`'s entry/stream model (S4.7).
//!
//! This crate supplies two [`http_cache_core::StorageEngine`] implementations:
//!
//! - [`MemoryStorage`]: a `DashMap`-backed, non-persistent store for tests
//!   and single-process use.
//! - [`SqliteStorage`]: a `rusqlite`-backed relational store for anything
//!   that needs the cache to survive a restart.
//!
//! Both share the same persisted-entry shape ([`StoredEntryData`]) and
//! garbage-collection thresholds (see the `gc` module).

#![forbid(unsafe_code)]
#![deny(missing_debug_implementations)]

mod entry;
mod error;
mod gc;
mod memory;
mod sqlite;

pub use entry::{Entry, PendingData, PersistedRecord, StoredEntryData};
pub use error::{StorageError, StorageResult};
pub use gc::{SweepGate, INCOMPLETE_ABANDON_AGE, SOFT_DELETE_GRACE, SWEEP_INTERVAL};
pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;

#[cfg(test)]
mod test;
