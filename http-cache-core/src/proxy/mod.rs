//! The cache proxy: the driver that ties the state machine and the storage
//! engine together (S4.8).

#[cfg(feature = "blocking")]
mod blocking;

#[cfg(feature = "blocking")]
pub use blocking::BlockingCacheProxy;

use std::sync::Arc;

use async_trait::async_trait;
use http::{HeaderValue, Method, StatusCode};
use log::{debug, warn};
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::error::{CacheError, Result};
use crate::metadata::ResponseMetadata;
use crate::model::Request;
use crate::model::Response;
use crate::options::CacheOptions;
use crate::policy::Policy;
use crate::state_machine::{CacheMissDecision, IdleClient, IdleDecision, RevalidationOutcome};
use crate::storage_engine::{EntryUpdate, NewEntry, StorageEngine};

/// Sends a request to the origin and returns its response and fully-read
/// body. Implemented by HTTP-client integrations, which are outside this
/// crate (S1's out-of-scope clause); the proxy only depends on this trait.
#[async_trait]
pub trait RequestSender: Send + Sync {
    /// Performs `request` against the origin, returning the response and its
    /// buffered body bytes.
    async fn send(&self, request: &Request) -> Result<(Response, Vec<u8>)>;
}

/// The result of [`AsyncCacheProxy::handle_request`]: a response plus the
/// body bytes the caller should serve, and the cache observation metadata
/// attached to `response.metadata` as well (duplicated here for convenience).
pub struct ProxiedResponse {
    /// The response to return to the proxy's caller.
    pub response: Response,
    /// The response body.
    pub body: Vec<u8>,
}

/// Methods that trigger invalidation of their target resource on a
/// non-error response (S4.8's unsafe-method invalidation clause).
fn is_unsafe_method(method: &Method) -> bool {
    *method == Method::POST || *method == Method::PUT || *method == Method::DELETE || *method == Method::PATCH
}

/// Derives the canonical cache key for `request`: `METHOD|HOST|hash`, per
/// S4.8 step 1. `options.cache_key`, if set, overrides this entirely.
pub fn cache_key(request: &Request, options: &CacheOptions) -> Vec<u8> {
    if let Some(f) = &options.cache_key {
        return f(request);
    }
    let host = request.url.host_str().unwrap_or("");
    let mut hasher = blake3::Hasher::new();
    hasher.update(request.method.as_str().as_bytes());
    hasher.update(b"\0");
    hasher.update(request.url.as_str().as_bytes());
    if request.metadata.body_key {
        // Body bytes are not part of the `Request` model (bodies are
        // handled at the storage layer); integrations wanting body-keyed
        // cache entries must fold the body hash into a `cache_key` override
        // instead. We still mix in a stable marker so the key differs from
        // the non-body-keyed form, rather than silently ignoring the flag.
        hasher.update(b"\0body-key");
    }
    let digest = hasher.finalize();
    let hash_hex = hex::encode(&digest.as_bytes()[..16]);
    format!("{}|{}|{}", request.method.as_str(), host, hash_hex).into_bytes()
}

/// Synthesizes the `504 Gateway Timeout` returned when `only-if-cached`
/// finds nothing usable (S7's "user-visible failure" clause).
fn only_if_cached_timeout() -> Response {
    Response::new(StatusCode::GATEWAY_TIMEOUT, http::HeaderMap::new())
}

fn only_if_cached(request: &Request) -> bool {
    crate::directives::has_directive(
        &crate::directives::parse_cache_control(request.headers.get_all(http::header::CACHE_CONTROL)),
        "only-if-cached",
    )
}

/// The async cache proxy: drives [`crate::state_machine`] against a
/// [`StorageEngine`] and a [`RequestSender`] origin collaborator.
pub struct AsyncCacheProxy<S: StorageEngine, O: RequestSender> {
    storage: Arc<S>,
    origin: Arc<O>,
    policy: Policy,
    clock: Arc<dyn Clock>,
}

impl<S: StorageEngine, O: RequestSender> AsyncCacheProxy<S, O> {
    /// Builds a proxy over `storage` and `origin`, applying `policy`.
    pub fn new(storage: Arc<S>, origin: Arc<O>, policy: Policy) -> Self {
        Self { storage, origin, policy, clock: Arc::new(SystemClock) }
    }

    /// Overrides the clock (tests only need this; production code keeps the
    /// default [`SystemClock`]).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Only ever called on paths reached after `handle_request` has already
    /// dispatched `Policy::Filter` requests to `handle_request_filtered`.
    fn options(&self) -> &CacheOptions {
        match &self.policy {
            Policy::Specification(options) => options,
            Policy::Filter(_) => unreachable!("specification-only path reached under a filter policy"),
        }
    }

    /// Handles one request end to end: lookup, possible revalidation or
    /// origin fetch, store/invalidate decisions, and unsafe-method
    /// invalidation.
    pub async fn handle_request(&self, request: Request) -> Result<ProxiedResponse> {
        if let Policy::Filter(filter) = &self.policy {
            return self.handle_request_filtered(request, filter.clone()).await;
        }

        let options = self.options().clone();
        let key = cache_key(&request, &options);
        debug!("cache key {} for {} {}", String::from_utf8_lossy(&key), request.method, request.url);

        if is_unsafe_method(&request.method) {
            return self.handle_unsafe_method(request).await;
        }

        if only_if_cached(&request) {
            let candidates = self.get_entries_degraded(&key).await;
            if candidates.is_empty() {
                return Ok(ProxiedResponse { response: only_if_cached_timeout(), body: Vec::new() });
            }
        }

        let candidates = self.get_entries_degraded(&key).await;
        let now = self.clock.now();
        let idle = IdleClient { options: options.clone() };
        match idle.next(&request, candidates, now) {
            IdleDecision::FromCache(from_cache) => {
                debug!("serving {} {} from cache", request.method, request.url);
                let body = self.storage.read_body(from_cache.entry.id()).await?.unwrap_or_default();
                let mut response = Response::new(from_cache.entry.response_status(), from_cache.entry.response_headers().clone());
                response.metadata = ResponseMetadata { from_cache: true, revalidated: false, stored: false, ..Default::default() };
                if options.refresh_ttl_on_access {
                    let _ = self.storage.update_entry(from_cache.entry.id(), EntryUpdate::Touch).await;
                }
                Ok(ProxiedResponse { response, body })
            }
            IdleDecision::CacheMiss(miss) => self.handle_cache_miss(miss.request, &key, None).await,
            IdleDecision::NeedRevalidation(need) => {
                let conditional = need.conditional_request.clone();
                let original_request = need.original_request.clone();
                let (response, body) = match self.origin.send(&conditional).await {
                    Ok(pair) => pair,
                    Err(err) => {
                        warn!("origin request failed during revalidation: {err}");
                        return Err(err);
                    }
                };
                match need.next(&response, &options, now) {
                    RevalidationOutcome::NeedToBeUpdated(update) => {
                        let merged = update.next();
                        let entry_id = update.matched.id();
                        self.storage.update_entry(entry_id, EntryUpdate::MergeHeaders(merged.clone())).await?;
                        let mut out = Response::new(update.matched.response_status(), merged);
                        out.metadata = ResponseMetadata { from_cache: true, revalidated: true, stored: false, ..Default::default() };
                        let cached_body = self.storage.read_body(entry_id).await?.unwrap_or_default();
                        Ok(ProxiedResponse { response: out, body: cached_body })
                    }
                    RevalidationOutcome::InvalidatePairs(invalidate) => {
                        for id in &invalidate.ids {
                            self.storage.remove_entry(*id).await?;
                        }
                        self.handle_cache_miss(original_request, &key, Some((response, body))).await
                    }
                    RevalidationOutcome::StaleOnError(stale) => {
                        let body = self.storage.read_body(stale.entry.id()).await?.unwrap_or_default();
                        let mut out = Response::new(stale.entry.response_status(), stale.entry.response_headers().clone());
                        out.metadata = ResponseMetadata { from_cache: true, revalidated: false, stored: false, ..Default::default() };
                        Ok(ProxiedResponse { response: out, body })
                    }
                    RevalidationOutcome::Resolved(decision) => {
                        let pending = self
                            .storage
                            .create_entry(NewEntry { request: &original_request, response: None, response_body: None, cache_key: None, id: None })
                            .await?;
                        self.finish_cache_miss_decision(decision, &key, pending.id(), response, body).await
                    }
                }
            }
        }
    }

    /// Handles a cache miss: creates an **incomplete** entry (§3's entry
    /// lifecycle) before awaiting the origin so that a cancelled await
    /// leaves only an abandoned-incomplete row for the GC to reap, never a
    /// half-written complete one (§5's cancellation clause). `already_fetched`
    /// covers the cascaded `InvalidatePairs -> CacheMiss` path (§4.1), where
    /// the origin's answer to the *conditional* request already arrived and
    /// is reused as this miss's response.
    async fn handle_cache_miss(
        &self,
        request: Request,
        key: &[u8],
        already_fetched: Option<(Response, Vec<u8>)>,
    ) -> Result<ProxiedResponse> {
        match already_fetched {
            Some((response, body)) => self.store_or_discard(&request, key, response, body).await,
            None => {
                let pending = self
                    .storage
                    .create_entry(NewEntry { request: &request, response: None, response_body: None, cache_key: None, id: None })
                    .await?;
                let pair_id = pending.id();
                let (response, body) = match self.origin.send(&request).await {
                    Ok(pair) => pair,
                    Err(err) => {
                        if let Err(cleanup_err) = self.storage.remove_entry(pair_id).await {
                            warn!("failed to discard abandoned incomplete entry {pair_id}: {cleanup_err}");
                        }
                        return Err(err);
                    }
                };
                let options = self.options().clone();
                let miss = crate::state_machine::CacheMiss { request: request.clone() };
                let decision = miss.next(&response, &options);
                self.finish_cache_miss_decision(decision, key, pair_id, response, body).await
            }
        }
    }

    /// Evaluates storability for a response already in hand (no further
    /// origin await needed) and persists or discards it. Used by the
    /// `already_fetched` branch above and by the revalidation-resolved path.
    async fn store_or_discard(&self, request: &Request, key: &[u8], response: Response, body: Vec<u8>) -> Result<ProxiedResponse> {
        let options = self.options().clone();
        let pending = self
            .storage
            .create_entry(NewEntry { request, response: None, response_body: None, cache_key: None, id: None })
            .await?;
        let miss = crate::state_machine::CacheMiss { request: request.clone() };
        let decision = miss.next(&response, &options);
        self.finish_cache_miss_decision(decision, key, pending.id(), response, body).await
    }

    async fn finish_cache_miss_decision(
        &self,
        decision: CacheMissDecision,
        key: &[u8],
        pair_id: Uuid,
        response: Response,
        body: Vec<u8>,
    ) -> Result<ProxiedResponse> {
        match decision {
            CacheMissDecision::StoreAndUse(store) => {
                self.storage
                    .update_entry(pair_id, EntryUpdate::Attach { response: &response, response_body: &body, cache_key: key.to_vec() })
                    .await?;
                let mut out = response;
                out.metadata = ResponseMetadata { from_cache: false, revalidated: false, stored: true, spec_ignored: store.spec_ignored, ..Default::default() };
                Ok(ProxiedResponse { response: out, body })
            }
            CacheMissDecision::CouldNotBeStored(_) => {
                self.storage.remove_entry(pair_id).await?;
                let mut out = response;
                out.metadata = ResponseMetadata { from_cache: false, revalidated: false, stored: false, ..Default::default() };
                Ok(ProxiedResponse { response: out, body })
            }
        }
    }

    async fn handle_unsafe_method(&self, request: Request) -> Result<ProxiedResponse> {
        let (response, body) = self.origin.send(&request).await?;
        if !response.status.is_server_error() {
            if let Err(err) = self.invalidate_on_unsafe_method(&request, &response).await {
                warn!("invalidation after unsafe method failed: {err}");
            }
        }
        let mut out = response;
        out.metadata = ResponseMetadata::default();
        Ok(ProxiedResponse { response: out, body })
    }

    /// Invalidates cached representations of the effective request URI
    /// (S4.8's unsafe-method clause): the URI the unsafe request targets,
    /// and any URI a `Location`/`Content-Location` header on the response
    /// points at on the same host. Neither is keyed by the unsafe method
    /// itself, so this probes every method this cache actually stores
    /// responses for rather than the POST/PUT/DELETE/PATCH's own key.
    async fn invalidate_on_unsafe_method(&self, request: &Request, response: &Response) -> Result<()> {
        self.invalidate_url(&request.url).await?;
        for header_name in [http::header::LOCATION, http::header::CONTENT_LOCATION] {
            if let Some(target) = response.headers.get(header_name).and_then(|v: &HeaderValue| v.to_str().ok()) {
                if let Ok(url) = request.url.join(target) {
                    if url.host_str() == request.url.host_str() {
                        self.invalidate_url(&url).await?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Removes every entry stored under `url` for each of this cache's
    /// supported methods (normally `GET` and `HEAD`).
    async fn invalidate_url(&self, url: &url::Url) -> Result<()> {
        let methods: Vec<Method> = self.options().supported_methods.iter().cloned().collect();
        for method in methods {
            let probe = Request::new(method, url.clone(), http::HeaderMap::new());
            let probe_key = cache_key(&probe, self.options());
            for entry in self.get_entries_degraded(&probe_key).await {
                self.storage.remove_entry(entry.id()).await?;
            }
        }
        Ok(())
    }

    /// `get_entries`, degrading to an empty candidate set (treated as a
    /// cache miss) rather than propagating on [`CacheError::StorageUnavailable`]
    /// (S7).
    async fn get_entries_degraded(&self, key: &[u8]) -> Vec<S::Entry> {
        match self.storage.get_entries(key).await {
            Ok(entries) => entries,
            Err(err @ CacheError::StorageUnavailable(_)) => {
                warn!("storage unavailable, degrading to pass-through: {err}");
                Vec::new()
            }
            Err(err) => {
                warn!("storage error, degrading to pass-through: {err}");
                Vec::new()
            }
        }
    }

    async fn handle_request_filtered(&self, request: Request, filter: crate::policy::FilterPolicy) -> Result<ProxiedResponse> {
        if !filter.accepts_request(&request) {
            let (response, body) = self.origin.send(&request).await?;
            return Ok(ProxiedResponse { response, body });
        }
        let key = cache_key(&request, &CacheOptions::default());
        let candidates = self.get_entries_degraded(&key).await;
        if let Some(entry) = candidates.into_iter().max_by_key(|e| e.created_at()) {
            let body = self.storage.read_body(entry.id()).await?.unwrap_or_default();
            let mut response = Response::new(entry.response_status(), entry.response_headers().clone());
            response.metadata = ResponseMetadata { from_cache: true, ..Default::default() };
            return Ok(ProxiedResponse { response, body });
        }
        let (response, body) = self.origin.send(&request).await?;
        if filter.accepts_response(&response) {
            let new_entry = NewEntry { request: &request, response: Some(&response), response_body: Some(&body), cache_key: Some(key), id: None };
            self.storage.create_entry(new_entry).await?;
            let mut out = response;
            out.metadata = ResponseMetadata { from_cache: false, stored: true, ..Default::default() };
            return Ok(ProxiedResponse { response: out, body });
        }
        Ok(ProxiedResponse { response, body })
    }
}
