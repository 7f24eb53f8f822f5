//! `MemoryStorage`: the non-persistent backend (§4.7.1), for tests and
//! ephemeral in-process use.
//!
//! Backed by a [`DashMap`] keyed by entry id, plus a secondary
//! `DashMap<Vec<u8>, HashSet<Uuid>>` index from cache key to entry ids, the
//! same sharded-lock concurrency model `dashmap` gives for free, applied
//! here to the full entry/stream model rather than a single response cache.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use dashmap::DashMap;
use http::HeaderMap;
use http_cache_core::{CacheError, Clock, NewEntry, Request, Response, Result, StorageEngine, SystemClock};
use uuid::Uuid;

use crate::entry::{Entry, StoredEntryData};
use crate::gc::{self, SweepGate};

/// Response body split into chunks no larger than this, mirroring the
/// `streams` table's per-chunk rows and the 128 KB in-memory teeing limit
/// noted in the crate's design notes.
const CHUNK_SIZE: usize = 128 * 1024;

#[derive(Debug, Clone)]
struct Snapshot {
    request: Request,
}

#[derive(Debug)]
struct Record {
    id: Uuid,
    cache_key: Option<Vec<u8>>,
    snapshot: Snapshot,
    data: Option<StoredEntryData>,
    body_chunks: Vec<Vec<u8>>,
    body_complete: bool,
    ttl: Option<Duration>,
    created_at: SystemTime,
    deleted_at: Option<SystemTime>,
}

impl Record {
    fn is_complete(&self) -> bool {
        self.data.is_some() && self.body_complete
    }

    fn is_visible(&self) -> bool {
        self.deleted_at.is_none() && self.is_complete()
    }

    fn to_entry(&self) -> Option<crate::error::StorageResult<Entry>> {
        let data = self.data.clone()?;
        let cache_key = self.cache_key.clone().unwrap_or_default();
        Some(Entry::from_stored(self.id, cache_key, data))
    }
}

fn chunk(body: &[u8]) -> Vec<Vec<u8>> {
    if body.is_empty() {
        return vec![Vec::new()];
    }
    body.chunks(CHUNK_SIZE).map(|c| c.to_vec()).collect()
}

/// The in-memory [`StorageEngine`] backend.
#[derive(Debug)]
pub struct MemoryStorage {
    entries: DashMap<Uuid, Record>,
    by_key: DashMap<Vec<u8>, HashSet<Uuid>>,
    gate: SweepGate,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStorage {
    /// An empty in-memory store, timestamped by [`SystemClock`].
    pub fn new() -> Self {
        Self { entries: DashMap::new(), by_key: DashMap::new(), gate: SweepGate::new(), clock: Arc::new(SystemClock) }
    }

    /// An empty in-memory store timestamped by `clock` instead of the system
    /// clock, so `created_at`/GC math can be driven deterministically (tests
    /// pairing this backend with a proxy built on the same fixed clock).
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self { entries: DashMap::new(), by_key: DashMap::new(), gate: SweepGate::new(), clock }
    }

    fn now(&self) -> SystemTime {
        self.clock.now()
    }

    fn index_insert(&self, key: &[u8], id: Uuid) {
        self.by_key.entry(key.to_vec()).or_default().insert(id);
    }

    fn index_remove(&self, key: &[u8], id: Uuid) {
        if let Some(mut set) = self.by_key.get_mut(key) {
            set.remove(&id);
        }
    }

    /// Runs the opportunistic §4.7 cleanup sweep if the rate gate allows it.
    fn maybe_sweep(&self) {
        let now = self.now();
        if !self.gate.should_sweep(now) {
            return;
        }
        let mut dead = Vec::new();
        for entry in self.entries.iter() {
            let r = entry.value();
            let expired_ttl = r.ttl.map(|ttl| gc::past_ttl(r.created_at, now, ttl)).unwrap_or(false);
            let abandoned_incomplete = !r.is_complete() && gc::past_abandon_age(r.created_at, now);
            let soft_deleted_past_grace = r.deleted_at.map(|d| gc::past_soft_delete_grace(d, now)).unwrap_or(false);
            if expired_ttl || abandoned_incomplete || soft_deleted_past_grace {
                dead.push((r.id, r.cache_key.clone()));
            }
        }
        for (id, key) in dead {
            self.entries.remove(&id);
            if let Some(key) = key {
                self.index_remove(&key, id);
            }
        }
    }

    fn get_record(&self, id: Uuid) -> Option<dashmap::mapref::one::Ref<'_, Uuid, Record>> {
        self.entries.get(&id)
    }
}

#[async_trait]
impl StorageEngine for MemoryStorage {
    type Entry = Entry;

    async fn get_entries(&self, cache_key: &[u8]) -> Result<Vec<Entry>> {
        self.maybe_sweep();
        let mut out = Vec::new();
        if let Some(ids) = self.by_key.get(cache_key) {
            for id in ids.iter() {
                if let Some(record) = self.get_record(*id) {
                    if record.is_visible() {
                        if let Some(built) = record.to_entry() {
                            match built {
                                Ok(entry) => out.push(entry),
                                Err(err) => {
                                    log::error!("corrupt memory entry {id}: {err}");
                                    drop(record);
                                    self.entries.remove(id);
                                }
                            }
                        }
                    }
                }
            }
        }
        Ok(out)
    }

    async fn create_entry(&self, new: NewEntry<'_>) -> Result<Entry> {
        self.maybe_sweep();
        let now = self.now();
        let id = new.id.unwrap_or_else(Uuid::new_v4);
        let ttl = new.request.metadata.ttl.map(Duration::from_secs_f64);

        let (data, body_chunks, body_complete) = match new.response {
            Some(response) => {
                let data = StoredEntryData::capture(new.request, response, now);
                let body = new.response_body.unwrap_or_default();
                (Some(data), chunk(body), true)
            }
            None => (None, Vec::new(), false),
        };

        let cache_key = new.cache_key.clone();
        let record = Record {
            id,
            cache_key: cache_key.clone(),
            snapshot: Snapshot { request: new.request.clone() },
            data,
            body_chunks,
            body_complete,
            ttl,
            created_at: now,
            deleted_at: None,
        };
        let is_complete = record.is_complete();
        self.entries.insert(id, record);
        if is_complete {
            if let Some(key) = &cache_key {
                self.index_insert(key, id);
            }
        }
        let record = self.get_record(id).expect("just inserted");
        record.to_entry().unwrap_or_else(|| {
            // Incomplete: synthesize a placeholder complete-shaped entry is
            // not meaningful; callers of `create_entry` on an incomplete
            // path never inspect the returned `Entry`'s response fields
            // before it's completed via `update_entry`.
            let placeholder = Response::new(http::StatusCode::PROCESSING, HeaderMap::new());
            Entry::new(id, Vec::new(), &record.snapshot.request, &placeholder, now)
        }).map_err(Into::into)
    }

    async fn update_entry(&self, id: Uuid, update: http_cache_core::EntryUpdate<'_>) -> Result<Option<Entry>> {
        self.maybe_sweep();
        let now = self.now();
        use http_cache_core::EntryUpdate;
        let Some(mut record) = self.entries.get_mut(&id) else { return Ok(None) };

        let newly_keyed = match update {
            EntryUpdate::Attach { response, response_body, cache_key } => {
                let data = StoredEntryData::capture(&record.snapshot.request, response, now);
                record.data = Some(data);
                record.body_chunks = chunk(response_body);
                record.body_complete = true;
                record.cache_key = Some(cache_key.clone());
                Some(cache_key)
            }
            EntryUpdate::MergeHeaders(merged) => {
                let Some(existing) = record.data.clone() else { return Ok(None) };
                let cache_key = record.cache_key.clone().unwrap_or_default();
                let entry = Entry::from_stored(id, cache_key, existing).map_err(CacheError::from)?;
                let updated = entry.with_merged_headers(&merged, now).map_err(CacheError::from)?;
                record.data = Some(updated.data().clone());
                record.created_at = now;
                None
            }
            EntryUpdate::Touch => {
                if let Some(data) = &mut record.data {
                    data.created_at = now.duration_since(std::time::UNIX_EPOCH).unwrap_or_default().as_secs_f64();
                }
                record.created_at = now;
                None
            }
        };

        let built = record.to_entry().transpose().map_err(CacheError::from)?;
        drop(record);
        if let Some(cache_key) = newly_keyed {
            self.index_insert(&cache_key, id);
        }
        Ok(built)
    }

    async fn read_body(&self, id: Uuid) -> Result<Option<Vec<u8>>> {
        self.maybe_sweep();
        let Some(record) = self.get_record(id) else { return Ok(None) };
        if !record.body_complete {
            return Ok(None);
        }
        let mut out = Vec::new();
        for chunk in &record.body_chunks {
            out.extend_from_slice(chunk);
        }
        Ok(Some(out))
    }

    async fn remove_entry(&self, id: Uuid) -> Result<()> {
        let now = self.now();
        if let Some(mut record) = self.entries.get_mut(&id) {
            record.deleted_at = Some(now);
        }
        self.maybe_sweep();
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.entries.clear();
        self.by_key.clear();
        Ok(())
    }
}

/// Shared handle convenience: `Arc<MemoryStorage>` is the typical way this
/// backend is handed to [`http_cache_core::AsyncCacheProxy::new`].
pub fn shared() -> Arc<MemoryStorage> {
    Arc::new(MemoryStorage::new())
}
