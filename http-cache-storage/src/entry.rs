//! The persisted entry type (§6.5's `StoredEntryData`) and its conversion to
//! and from [`http_cache_core::state_machine_api::CachedEntry`].
//!
//! Bodies are deliberately absent from this struct: per the data model, an
//! entry's bytes live in the `streams` table (or its in-memory analogue),
//! keyed by `(entry_id, kind, chunk_number)`, not inside the `data` blob.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use http_cache_core::state_machine_api::CachedEntry;
use http_cache_core::{Request, RequestMetadata, Response, ResponseMetadata};
use uuid::Uuid;

use crate::error::{StorageError, StorageResult};

/// The request-only half of an entry that exists before its response has
/// arrived (I3's "incomplete" state). Persisted backends need something to
/// put in the `data` column for a row that has no response yet; this is it.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PendingData {
    /// The request method, uppercase.
    pub method: String,
    /// The absolute request URL.
    pub url: String,
    /// Request headers at entry-creation time, as ordered name/value pairs.
    pub request_headers: Vec<(String, String)>,
    /// Request-scoped control metadata captured at entry-creation time.
    pub request_metadata: RequestMetadata,
    /// POSIX timestamp (seconds) this entry was created.
    pub created_at: f64,
    /// The TTL override in effect when the entry was created, if any,
    /// mirrored out of `request_metadata` so the GC sweep can read it
    /// without reconstructing headers.
    pub ttl: Option<f64>,
}

impl PendingData {
    /// Captures a request at the moment an incomplete entry is created,
    /// before the origin has been asked for a response.
    pub fn capture(request: &Request, created_at: SystemTime) -> Self {
        Self {
            method: request.method.as_str().to_owned(),
            url: request.url.to_string(),
            request_headers: header_map_to_pairs(&request.headers),
            request_metadata: request.metadata.clone(),
            created_at: system_time_to_secs(created_at),
            ttl: request.metadata.ttl,
        }
    }

    /// Reconstructs the original [`Request`] this pending row was created
    /// from, for completing it via [`StoredEntryData::capture`].
    pub fn to_request(&self) -> StorageResult<Request> {
        let method =
            Method::from_bytes(self.method.as_bytes()).map_err(|e| StorageError::Corrupt(e.to_string()))?;
        let url = url::Url::parse(&self.url).map_err(|e| StorageError::Corrupt(e.to_string()))?;
        let headers = pairs_to_header_map(&self.request_headers)?;
        let mut request = Request::new(method, url, headers);
        request.metadata = self.request_metadata.clone();
        Ok(request)
    }
}

/// What a backend's `data` column/value actually holds: either half of the
/// entry lifecycle (I3). Persisted uniformly so a sweep can tell pending and
/// complete rows apart without a separate `is_complete` column.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum PersistedRecord {
    /// Request stored, response not yet attached.
    Pending(PendingData),
    /// Request and response both present.
    Complete(StoredEntryData),
}

impl PersistedRecord {
    /// Encodes with `postcard`, the form used for the `entries.data` column.
    pub fn encode(&self) -> StorageResult<Vec<u8>> {
        postcard::to_stdvec(self).map_err(|e| StorageError::Corrupt(e.to_string()))
    }

    /// Decodes a `postcard`-encoded record.
    pub fn decode(bytes: &[u8]) -> StorageResult<Self> {
        postcard::from_bytes(bytes).map_err(|e| StorageError::Corrupt(e.to_string()))
    }
}

/// The self-describing key/value record persisted per entry (§6.5).
/// Encoded with `postcard` for the on-disk/in-memory `data` column;
/// `serde_json` is available under the `json` feature as the
/// human-inspectable alternative.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct StoredEntryData {
    /// The request method, uppercase.
    pub method: String,
    /// The absolute request URL.
    pub url: String,
    /// The stored response's status code.
    pub status_code: u16,
    /// Request headers at store time, as ordered name/value pairs.
    pub request_headers: Vec<(String, String)>,
    /// Response headers at store time, as ordered name/value pairs.
    pub response_headers: Vec<(String, String)>,
    /// Request-scoped control metadata captured at store time.
    pub request_metadata: RequestMetadata,
    /// Response-observation metadata captured at store time.
    pub response_metadata: ResponseMetadata,
    /// POSIX timestamp (seconds) this entry was created, or last freshened.
    pub created_at: f64,
}

fn header_map_to_pairs(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str().to_owned(), v.to_owned())))
        .collect()
}

fn pairs_to_header_map(pairs: &[(String, String)]) -> StorageResult<HeaderMap> {
    let mut map = HeaderMap::with_capacity(pairs.len());
    for (name, value) in pairs {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| StorageError::Corrupt(format!("invalid header name {name:?}: {e}")))?;
        let value = HeaderValue::from_str(value).map_err(|e| StorageError::Corrupt(format!("invalid header value for {name}: {e}")))?;
        map.append(name, value);
    }
    Ok(map)
}

fn system_time_to_secs(t: SystemTime) -> f64 {
    t.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64()
}

fn secs_to_system_time(secs: f64) -> SystemTime {
    if secs >= 0.0 {
        UNIX_EPOCH + Duration::from_secs_f64(secs)
    } else {
        UNIX_EPOCH
    }
}

impl StoredEntryData {
    /// Captures the fields of §6.5 off a request/response pair at the
    /// moment they become a complete entry.
    pub fn capture(request: &Request, response: &Response, created_at: SystemTime) -> Self {
        Self {
            method: request.method.as_str().to_owned(),
            url: request.url.to_string(),
            status_code: response.status.as_u16(),
            request_headers: header_map_to_pairs(&request.headers),
            response_headers: header_map_to_pairs(&response.headers),
            request_metadata: request.metadata.clone(),
            response_metadata: response.metadata.clone(),
            created_at: system_time_to_secs(created_at),
        }
    }

    /// Encodes this record with `postcard`, the compact binary form used
    /// for the `entries.data` column / in-memory value.
    pub fn encode(&self) -> StorageResult<Vec<u8>> {
        postcard::to_stdvec(self).map_err(|e| StorageError::Corrupt(e.to_string()))
    }

    /// Decodes a `postcard`-encoded record. Failure here is the
    /// `SerializationError` case of §7: the caller soft-deletes the entry
    /// and skips it rather than propagating.
    pub fn decode(bytes: &[u8]) -> StorageResult<Self> {
        postcard::from_bytes(bytes).map_err(|e| StorageError::Corrupt(e.to_string()))
    }

    /// The human-inspectable `serde_json` encoding mentioned in §6.5.
    #[cfg(feature = "json")]
    pub fn encode_json(&self) -> StorageResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| StorageError::Corrupt(e.to_string()))
    }

    #[cfg(feature = "json")]
    pub fn decode_json(bytes: &[u8]) -> StorageResult<Self> {
        serde_json::from_slice(bytes).map_err(|e| StorageError::Corrupt(e.to_string()))
    }
}

/// A complete stored entry, materialized for the caching core: header maps
/// are parsed eagerly so repeated Vary-matching and freshness calculations
/// don't re-parse `data` on every candidate.
#[derive(Debug, Clone)]
pub struct Entry {
    id: Uuid,
    cache_key: Vec<u8>,
    data: StoredEntryData,
    request_headers: HeaderMap,
    response_headers: HeaderMap,
    created_at: SystemTime,
}

impl Entry {
    /// Builds a fresh complete entry from parts, assigning `created_at = now`.
    pub fn new(id: Uuid, cache_key: Vec<u8>, request: &Request, response: &Response, now: SystemTime) -> StorageResult<Self> {
        let data = StoredEntryData::capture(request, response, now);
        Self::from_stored(id, cache_key, data)
    }

    /// Reconstructs an [`Entry`] from its persisted [`StoredEntryData`],
    /// parsing header pairs back into [`HeaderMap`]s. Used by both backends
    /// when loading rows/values off disk or out of the in-memory map.
    pub fn from_stored(id: Uuid, cache_key: Vec<u8>, data: StoredEntryData) -> StorageResult<Self> {
        let request_headers = pairs_to_header_map(&data.request_headers)?;
        let response_headers = pairs_to_header_map(&data.response_headers)?;
        let created_at = secs_to_system_time(data.created_at);
        Ok(Self { id, cache_key, data, request_headers, response_headers, created_at })
    }

    /// The cache key this entry is stored under.
    pub fn cache_key(&self) -> &[u8] {
        &self.cache_key
    }

    /// The §6.5 record this entry serializes to.
    pub fn data(&self) -> &StoredEntryData {
        &self.data
    }

    /// Replaces this entry's response headers (§4.6's 304 merge) and bumps
    /// `created_at` to `now`, returning the updated `data` blob to persist.
    pub fn with_merged_headers(&self, merged: &HeaderMap, now: SystemTime) -> StorageResult<Self> {
        let mut data = self.data.clone();
        data.response_headers = header_map_to_pairs(merged);
        data.created_at = system_time_to_secs(now);
        Self::from_stored(self.id, self.cache_key.clone(), data)
    }

    /// Bumps `created_at` to `now` without touching anything else
    /// (`refresh_ttl_on_access`).
    pub fn touched(&self, now: SystemTime) -> StorageResult<Self> {
        let mut data = self.data.clone();
        data.created_at = system_time_to_secs(now);
        Self::from_stored(self.id, self.cache_key.clone(), data)
    }

    /// The original request's method, parsed back from the stored string.
    pub fn method(&self) -> StorageResult<Method> {
        Method::from_bytes(self.data.method.as_bytes()).map_err(|e| StorageError::Corrupt(e.to_string()))
    }

    /// The original request's URL, parsed back from the stored string.
    pub fn url(&self) -> StorageResult<url::Url> {
        url::Url::parse(&self.data.url).map_err(|e| StorageError::Corrupt(e.to_string()))
    }

    /// The stored response's status code.
    pub fn status(&self) -> StorageResult<StatusCode> {
        StatusCode::from_u16(self.data.status_code).map_err(|e| StorageError::Corrupt(e.to_string()))
    }
}

impl CachedEntry for Entry {
    fn id(&self) -> Uuid {
        self.id
    }

    fn request_headers(&self) -> &HeaderMap {
        &self.request_headers
    }

    fn response_headers(&self) -> &HeaderMap {
        &self.response_headers
    }

    fn response_status(&self) -> StatusCode {
        StatusCode::from_u16(self.data.status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    fn created_at(&self) -> SystemTime {
        self.created_at
    }
}
