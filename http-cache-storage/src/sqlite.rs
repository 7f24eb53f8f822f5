//! `SqliteStorage`: the reference relational backend (§4.7, §4.7.1).
//!
//! A single on-disk database with the two tables of §4.7's schema, opened
//! with `journal_mode=WAL` and `synchronous=NORMAL` — a cache may lose its
//! very last write on a crash, an acceptable tradeoff for a response cache,
//! not a system of record. A `busy_timeout` lets concurrent writers queue
//! rather than fail with `SQLITE_BUSY`. `rusqlite` is synchronous, so every
//! statement runs inside `tokio::task::spawn_blocking`, guarded by a single
//! `Mutex<Connection>` that serializes writers per §5's ordering guarantees;
//! readers and writers alike go through it, so `get_entries` never observes
//! a torn row.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use http_cache_core::{CacheError, Clock, EntryUpdate, NewEntry, Result, StorageEngine, SystemClock};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::entry::{Entry, PendingData, PersistedRecord, StoredEntryData};
use crate::error::StorageError;
use crate::gc::{self, SweepGate};

const RESPONSE_STREAM_KIND: i64 = 1;
const EOS_CHUNK_NUMBER: i64 = -1;
const CHUNK_SIZE: usize = 128 * 1024;

fn epoch_secs(t: SystemTime) -> f64 {
    t.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64()
}

fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.busy_timeout(Duration::from_secs(5))?;
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS entries (
            id BLOB PRIMARY KEY,
            cache_key BLOB NULL,
            data BLOB NOT NULL,
            created_at REAL NOT NULL,
            deleted_at REAL NULL
        );
        CREATE INDEX IF NOT EXISTS idx_entries_cache_key ON entries(cache_key);
        CREATE INDEX IF NOT EXISTS idx_entries_deleted_at ON entries(deleted_at);
        CREATE TABLE IF NOT EXISTS streams (
            entry_id BLOB NOT NULL,
            kind INTEGER NOT NULL,
            chunk_number INTEGER NOT NULL,
            chunk_data BLOB NOT NULL,
            PRIMARY KEY (entry_id, kind, chunk_number)
        );",
    )
}

fn write_response_stream(conn: &Connection, entry_id: Uuid, body: &[u8]) -> rusqlite::Result<()> {
    conn.execute("DELETE FROM streams WHERE entry_id = ?1 AND kind = ?2", params![entry_id.as_bytes().to_vec(), RESPONSE_STREAM_KIND])?;
    let chunks: Vec<&[u8]> = if body.is_empty() { vec![&body[..0]] } else { body.chunks(CHUNK_SIZE).collect() };
    for (n, chunk) in chunks.into_iter().enumerate() {
        conn.execute(
            "INSERT INTO streams (entry_id, kind, chunk_number, chunk_data) VALUES (?1, ?2, ?3, ?4)",
            params![entry_id.as_bytes().to_vec(), RESPONSE_STREAM_KIND, n as i64, chunk],
        )?;
    }
    conn.execute(
        "INSERT INTO streams (entry_id, kind, chunk_number, chunk_data) VALUES (?1, ?2, ?3, ?4)",
        params![entry_id.as_bytes().to_vec(), RESPONSE_STREAM_KIND, EOS_CHUNK_NUMBER, Vec::<u8>::new()],
    )?;
    Ok(())
}

fn read_response_stream(conn: &Connection, entry_id: Uuid) -> rusqlite::Result<Option<Vec<u8>>> {
    let has_sentinel: bool = conn
        .query_row(
            "SELECT 1 FROM streams WHERE entry_id = ?1 AND kind = ?2 AND chunk_number = ?3",
            params![entry_id.as_bytes().to_vec(), RESPONSE_STREAM_KIND, EOS_CHUNK_NUMBER],
            |_| Ok(()),
        )
        .optional()?
        .is_some();
    if !has_sentinel {
        return Ok(None);
    }
    let mut stmt = conn.prepare(
        "SELECT chunk_data FROM streams WHERE entry_id = ?1 AND kind = ?2 AND chunk_number >= 0 ORDER BY chunk_number ASC",
    )?;
    let mut body = Vec::new();
    let rows = stmt.query_map(params![entry_id.as_bytes().to_vec(), RESPONSE_STREAM_KIND], |row| row.get::<_, Vec<u8>>(0))?;
    for row in rows {
        body.extend_from_slice(&row?);
    }
    Ok(Some(body))
}

fn row_to_entry(id: Uuid, cache_key: Option<Vec<u8>>, data: Vec<u8>) -> crate::error::StorageResult<Option<Entry>> {
    let record: PersistedRecord = PersistedRecord::decode(&data)?;
    match record {
        PersistedRecord::Pending(_) => Ok(None),
        PersistedRecord::Complete(stored) => Ok(Some(Entry::from_stored(id, cache_key.unwrap_or_default(), stored)?)),
    }
}

/// The SQLite-backed [`StorageEngine`].
pub struct SqliteStorage {
    conn: Arc<Mutex<Connection>>,
    gate: Arc<SweepGate>,
    /// A strictly increasing counter mixed into generated UUIDs' entropy is
    /// unnecessary (UUIDv4 is already random); kept only to let tests assert
    /// how many sweeps ran.
    sweep_count: Arc<AtomicI64>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for SqliteStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStorage").field("sweep_count", &self.sweep_count.load(Ordering::Relaxed)).finish_non_exhaustive()
    }
}

impl SqliteStorage {
    /// Opens (creating if absent) a SQLite database at `path`.
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let conn = Connection::open(path).map_err(StorageError::from)?;
        init_schema(&conn).map_err(StorageError::from)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            gate: Arc::new(SweepGate::new()),
            sweep_count: Arc::new(AtomicI64::new(0)),
            clock: Arc::new(SystemClock),
        })
    }

    /// Opens a private in-memory SQLite database (useful for tests that
    /// want the relational backend's exact code path without a temp file).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(StorageError::from)?;
        init_schema(&conn).map_err(StorageError::from)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            gate: Arc::new(SweepGate::new()),
            sweep_count: Arc::new(AtomicI64::new(0)),
            clock: Arc::new(SystemClock),
        })
    }

    /// Overrides the clock driving `created_at` stamps and GC sweeps,
    /// instead of the system clock (tests pairing this backend with a proxy
    /// built on the same fixed clock).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().unwrap_or_else(|poison| poison.into_inner());
            f(&guard)
        })
        .await
        .map_err(|e| CacheError::from(StorageError::Worker(e.to_string())))?
        .map_err(|e| CacheError::from(StorageError::from(e)))
    }

    /// Runs the §4.7 cleanup sweep if the rate gate allows it.
    async fn maybe_sweep(&self) {
        let now = self.clock.now();
        if !self.gate.should_sweep(now) {
            return;
        }
        self.sweep_count.fetch_add(1, Ordering::Relaxed);
        let conn = self.conn.clone();
        let result = tokio::task::spawn_blocking(move || -> rusqlite::Result<()> {
            let guard = conn.lock().unwrap_or_else(|poison| poison.into_inner());
            sweep_once(&guard, now)
        })
        .await;
        if let Ok(Err(err)) = result {
            log::warn!("sqlite storage gc sweep failed: {err}");
        }
    }

    /// Number of sweeps this instance has actually run (test/diagnostic use).
    pub fn sweep_count(&self) -> i64 {
        self.sweep_count.load(Ordering::Relaxed)
    }
}

fn sweep_once(conn: &Connection, now: SystemTime) -> rusqlite::Result<()> {
    let mut stmt = conn.prepare("SELECT id, data, created_at, deleted_at FROM entries")?;
    let mut dead: Vec<Vec<u8>> = Vec::new();
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, Vec<u8>>(1)?, row.get::<_, f64>(2)?, row.get::<_, Option<f64>>(3)?))
    })?;
    for row in rows {
        let (id_bytes, data, created_at_secs, deleted_at_secs) = row?;
        let created_at = UNIX_EPOCH + Duration::from_secs_f64(created_at_secs.max(0.0));
        let deleted_at = deleted_at_secs.map(|s| UNIX_EPOCH + Duration::from_secs_f64(s.max(0.0)));

        let mut should_delete = deleted_at.map(|d| gc::past_soft_delete_grace(d, now)).unwrap_or(false);

        if !should_delete {
            match PersistedRecord::decode(&data) {
                Ok(PersistedRecord::Pending(pending)) => {
                    if gc::past_abandon_age(created_at, now) {
                        should_delete = true;
                    }
                    if let Some(ttl) = pending.ttl {
                        if gc::past_ttl(created_at, now, Duration::from_secs_f64(ttl)) {
                            should_delete = true;
                        }
                    }
                }
                Ok(PersistedRecord::Complete(stored)) => {
                    if let Some(ttl) = stored.request_metadata.ttl {
                        if gc::past_ttl(created_at, now, Duration::from_secs_f64(ttl)) {
                            should_delete = true;
                        }
                    }
                    if !should_delete {
                        let has_sentinel: bool = conn
                            .query_row(
                                "SELECT 1 FROM streams WHERE entry_id = ?1 AND kind = ?2 AND chunk_number = ?3",
                                params![id_bytes, RESPONSE_STREAM_KIND, EOS_CHUNK_NUMBER],
                                |_| Ok(()),
                            )
                            .optional()?
                            .is_some();
                        if !has_sentinel && gc::past_abandon_age(created_at, now) {
                            should_delete = true;
                        }
                    }
                }
                Err(_) => should_delete = true,
            }
        }

        if should_delete {
            dead.push(id_bytes);
        }
    }

    for id_bytes in dead {
        conn.execute("DELETE FROM entries WHERE id = ?1", params![id_bytes])?;
        conn.execute("DELETE FROM streams WHERE entry_id = ?1", params![id_bytes])?;
    }
    Ok(())
}

#[async_trait]
impl StorageEngine for SqliteStorage {
    type Entry = Entry;

    async fn get_entries(&self, cache_key: &[u8]) -> Result<Vec<Entry>> {
        self.maybe_sweep().await;
        let key = cache_key.to_vec();
        let now = self.clock.now();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare("SELECT id, data FROM entries WHERE cache_key = ?1 AND deleted_at IS NULL")?;
            let rows = stmt.query_map(params![key], |row| Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, Vec<u8>>(1)?)))?;
            let mut out = Vec::new();
            let mut corrupt = Vec::new();
            for row in rows {
                let (id_bytes, data) = row?;
                let Ok(id) = Uuid::from_slice(&id_bytes) else { continue };
                match row_to_entry(id, Some(id_bytes.clone()), data) {
                    Ok(Some(entry)) => out.push(entry),
                    Ok(None) => {}
                    Err(err) => {
                        log::error!("corrupt sqlite entry {id}: {err}");
                        corrupt.push(id_bytes);
                    }
                }
            }
            for id_bytes in corrupt {
                conn.execute("UPDATE entries SET deleted_at = ?1 WHERE id = ?2", params![epoch_secs(now), id_bytes])?;
            }
            Ok(out)
        })
        .await
        .map(|mut entries| {
            entries.retain(|e| e.cache_key() == cache_key);
            entries
        })
    }

    async fn create_entry(&self, new: NewEntry<'_>) -> Result<Entry> {
        self.maybe_sweep().await;
        let now = self.clock.now();
        let id = new.id.unwrap_or_else(Uuid::new_v4);
        let id_bytes = id.as_bytes().to_vec();

        let record = match new.response {
            Some(response) => PersistedRecord::Complete(StoredEntryData::capture(new.request, response, now)),
            None => PersistedRecord::Pending(PendingData::capture(new.request, now)),
        };
        let bytes = record.encode().map_err(CacheError::from)?;
        let cache_key = new.cache_key.clone();
        let cache_key_for_insert = cache_key.clone();
        let created_at_secs = epoch_secs(now);
        let body = new.response_body.map(|b| b.to_vec());

        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO entries (id, cache_key, data, created_at, deleted_at) VALUES (?1, ?2, ?3, ?4, NULL)",
                params![id_bytes, cache_key_for_insert, bytes, created_at_secs],
            )?;
            if let Some(body) = &body {
                write_response_stream(conn, id, body)?;
            }
            Ok(())
        })
        .await?;

        match new.response {
            Some(response) => Entry::new(id, cache_key.unwrap_or_default(), new.request, response, now).map_err(CacheError::from),
            None => {
                let placeholder = http_cache_core::Response::new(http::StatusCode::PROCESSING, http::HeaderMap::new());
                Entry::new(id, Vec::new(), new.request, &placeholder, now).map_err(CacheError::from)
            }
        }
    }

    async fn update_entry(&self, id: Uuid, update: EntryUpdate<'_>) -> Result<Option<Entry>> {
        self.maybe_sweep().await;
        let now = self.clock.now();
        let id_bytes = id.as_bytes().to_vec();

        let existing: Option<Vec<u8>> = self
            .with_conn({
                let id_bytes = id_bytes.clone();
                move |conn| {
                    conn.query_row("SELECT data FROM entries WHERE id = ?1", params![id_bytes], |row| row.get::<_, Vec<u8>>(0))
                        .optional()
                }
            })
            .await?;
        let Some(existing_bytes) = existing else { return Ok(None) };
        let existing_record = PersistedRecord::decode(&existing_bytes).map_err(CacheError::from)?;

        match update {
            EntryUpdate::Attach { response, response_body, cache_key } => {
                let pending_request = match &existing_record {
                    PersistedRecord::Pending(p) => p.clone(),
                    PersistedRecord::Complete(_) => return Err(CacheError::StateMachineMisuse("Attach on an already-complete entry".into())),
                };
                let request = pending_request.to_request().map_err(CacheError::from)?;
                let data = StoredEntryData::capture(&request, response, now);
                let bytes = PersistedRecord::Complete(data).encode().map_err(CacheError::from)?;
                let body = response_body.to_vec();
                let cache_key_for_update = cache_key.clone();
                self.with_conn(move |conn| {
                    conn.execute(
                        "UPDATE entries SET cache_key = ?1, data = ?2, created_at = ?3 WHERE id = ?4",
                        params![cache_key_for_update, bytes, epoch_secs(now), id_bytes],
                    )?;
                    write_response_stream(conn, id, &body)
                })
                .await?;
                Entry::new(id, cache_key, &request, response, now).map(Some).map_err(CacheError::from)
            }
            EntryUpdate::MergeHeaders(merged) => {
                let PersistedRecord::Complete(stored) = existing_record else { return Ok(None) };
                let cache_key = self
                    .with_conn({
                        let id_bytes = id_bytes.clone();
                        move |conn| {
                        conn.query_row("SELECT cache_key FROM entries WHERE id = ?1", params![id_bytes], |row| row.get::<_, Vec<u8>>(0))
                            .optional()
                    }
                    })
                    .await?
                    .unwrap_or_default();
                let entry = Entry::from_stored(id, cache_key, stored).map_err(CacheError::from)?;
                let updated = entry.with_merged_headers(&merged, now).map_err(CacheError::from)?;
                let bytes = PersistedRecord::Complete(updated.data().clone()).encode().map_err(CacheError::from)?;
                self.with_conn(move |conn| {
                    conn.execute("UPDATE entries SET data = ?1, created_at = ?2 WHERE id = ?3", params![bytes, epoch_secs(now), id_bytes])
                })
                .await?;
                Ok(Some(updated))
            }
            EntryUpdate::Touch => {
                let PersistedRecord::Complete(mut stored) = existing_record else { return Ok(None) };
                stored.created_at = epoch_secs(now);
                let cache_key = self
                    .with_conn({
                        let id_bytes = id_bytes.clone();
                        move |conn| {
                        conn.query_row("SELECT cache_key FROM entries WHERE id = ?1", params![id_bytes], |row| row.get::<_, Vec<u8>>(0))
                            .optional()
                    }
                    })
                    .await?
                    .unwrap_or_default();
                let bytes = PersistedRecord::Complete(stored.clone()).encode().map_err(CacheError::from)?;
                self.with_conn(move |conn| {
                    conn.execute("UPDATE entries SET data = ?1, created_at = ?2 WHERE id = ?3", params![bytes, epoch_secs(now), id_bytes])
                })
                .await?;
                Entry::from_stored(id, cache_key, stored).map(Some).map_err(CacheError::from)
            }
        }
    }

    async fn read_body(&self, id: Uuid) -> Result<Option<Vec<u8>>> {
        self.maybe_sweep().await;
        self.with_conn(move |conn| read_response_stream(conn, id)).await
    }

    async fn remove_entry(&self, id: Uuid) -> Result<()> {
        let now = epoch_secs(self.clock.now());
        let id_bytes = id.as_bytes().to_vec();
        self.with_conn(move |conn| conn.execute("UPDATE entries SET deleted_at = ?1 WHERE id = ?2", params![now, id_bytes]).map(|_| ())).await?;
        self.maybe_sweep().await;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
