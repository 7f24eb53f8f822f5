//! The storage-facing interface the proxy drives (S6.1).
//!
//! This crate defines the trait; the concrete relational and in-memory
//! backends live in the sibling `http-cache-storage` crate, which also
//! supplies the `Entry` type satisfying [`crate::state_machine::CachedEntry`].
//! Keeping the trait here (rather than in the storage crate) lets the proxy,
//! defined in this crate, depend on storage only through this interface.

use async_trait::async_trait;
use http::HeaderMap;
use uuid::Uuid;

use crate::error::Result;
use crate::model::{Request, Response};
use crate::state_machine::CachedEntry;

/// Inputs for creating a new entry (S4.7's `create_entry`). An entry created
/// with `response: None` is **incomplete** and is not visible to
/// [`StorageEngine::get_entries`] until completed via
/// [`EntryUpdate::Attach`].
pub struct NewEntry<'a> {
    /// The request that produced (or is producing) this entry.
    pub request: &'a Request,
    /// The response to store, if already known.
    pub response: Option<&'a Response>,
    /// The response body, if `response` is `Some`.
    pub response_body: Option<&'a [u8]>,
    /// The cache key to store under. `None` leaves the entry incomplete.
    pub cache_key: Option<Vec<u8>>,
    /// A caller-assigned identifier; a fresh UUID is generated if `None`.
    pub id: Option<Uuid>,
}

/// The concrete update shapes the proxy issues against `update_entry` (S4.8
/// steps 4-6). The abstract "new value or update function" of S6.1 is made
/// concrete here since an opaque `Entry -> Entry` closure cannot cross the
/// `async_trait` object boundary while staying `Send`.
pub enum EntryUpdate<'a> {
    /// Completes a previously-incomplete entry: attaches the response body
    /// and assigns its cache key (S4.8 step 6).
    Attach { response: &'a Response, response_body: &'a [u8], cache_key: Vec<u8> },
    /// Replaces stored response headers with a 304's merged headers and
    /// bumps `created_at` to `now` (S4.6).
    MergeHeaders(HeaderMap),
    /// Bumps `created_at` to `now` without changing anything else
    /// (`refresh_ttl_on_access`).
    Touch,
}

/// Persistent storage for entries and their response body streams (S6.1,
/// S4.7). Implementors provide both the CRUD operations and the opportunistic
/// garbage collection sweep described in S4.7.
#[async_trait]
pub trait StorageEngine: Send + Sync {
    /// The concrete stored-entry type this backend returns.
    type Entry: CachedEntry + Clone;

    /// Returns every complete, non-soft-deleted, non-expired entry stored
    /// under `cache_key`.
    async fn get_entries(&self, cache_key: &[u8]) -> Result<Vec<Self::Entry>>;

    /// Creates a new entry, complete or incomplete depending on `new.response`.
    async fn create_entry(&self, new: NewEntry<'_>) -> Result<Self::Entry>;

    /// Applies `update` to the entry identified by `id`. Returns `None` if
    /// no such entry exists (it may have been concurrently removed).
    async fn update_entry(&self, id: Uuid, update: EntryUpdate<'_>) -> Result<Option<Self::Entry>>;

    /// Reads back the full (reassembled) response body of a complete entry.
    async fn read_body(&self, id: Uuid) -> Result<Option<Vec<u8>>>;

    /// Soft-deletes the entry identified by `id`.
    async fn remove_entry(&self, id: Uuid) -> Result<()>;

    /// Releases any backend resources (connections, file handles).
    async fn close(&self) -> Result<()>;
}
