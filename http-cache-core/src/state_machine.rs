//! The RFC 9111 decision state machine (S4.1).
//!
//! Every state is its own struct with inherent transition methods, rather
//! than a single `CacheState` trait object — the per-state `next()` methods
//! take different argument shapes (S9's redesign note), which a shared trait
//! method couldn't express without losing the static guarantee that a
//! terminal state has no `next()` at all. Transition methods never perform
//! I/O; callers (the proxy) run them between I/O steps.

use std::collections::HashSet;
use std::time::SystemTime;

use http::header::{ETAG, LAST_MODIFIED};
use http::{HeaderMap, StatusCode};
use uuid::Uuid;

use crate::directives::{directive_seconds, has_directive, parse_cache_control, stale_tolerance_directive};
use crate::freshness::{self, FreshnessInputs};
use crate::model::{Request, Response};
use crate::options::CacheOptions;
use crate::revalidation;
use crate::storability;
use crate::vary;

/// A stored request/response pair as the state machine needs to see it.
/// Implemented by the storage crate's concrete entry type; kept minimal so
/// this crate never depends on a storage backend.
pub trait CachedEntry: Send + Sync {
    /// The entry's unique identifier.
    fn id(&self) -> Uuid;
    /// The headers of the request that created this entry.
    fn request_headers(&self) -> &HeaderMap;
    /// The stored response's headers.
    fn response_headers(&self) -> &HeaderMap;
    /// The stored response's status code.
    fn response_status(&self) -> StatusCode;
    /// When this entry was stored (or last freshened).
    fn created_at(&self) -> SystemTime;
}

fn freshness_inputs<E: CachedEntry>(entry: &E) -> FreshnessInputs {
    FreshnessInputs::from_headers(entry.response_headers(), entry.created_at())
}

fn freshness_lifetime<E: CachedEntry>(entry: &E, options: &CacheOptions) -> std::time::Duration {
    let mut lifetime = freshness::freshness_lifetime(
        entry.response_headers(),
        options.privacy(),
        freshness_inputs(entry).date,
        std::time::Duration::from_secs(24 * 3600),
        freshness::DEFAULT_HEURISTIC_FRACTION,
        options.heuristically_cacheable_status(entry.response_status().as_u16()),
    );
    if let Some(max_ttl) = options.max_ttl {
        lifetime = lifetime.min(max_ttl);
    }
    lifetime
}

fn has_validator(headers: &HeaderMap) -> bool {
    headers.contains_key(ETAG) || headers.contains_key(LAST_MODIFIED)
}

/// Entry point of the state machine: an idle client about to look up a
/// request against candidate stored entries sharing its cache key.
#[derive(Debug, Clone)]
pub struct IdleClient {
    /// Options governing this lookup.
    pub options: CacheOptions,
}

/// The outcome of [`IdleClient::next`].
pub enum IdleDecision<E: CachedEntry> {
    /// No usable candidate; an origin request is required.
    CacheMiss(CacheMiss),
    /// A fresh candidate (or a stale one within the request's `max-stale`
    /// tolerance) exists and may be served directly.
    FromCache(FromCache<E>),
    /// A stale candidate exists with a validator; revalidate it.
    NeedRevalidation(NeedRevalidation<E>),
}

impl IdleClient {
    /// Decides what to do with `request` given `candidates`, the complete
    /// stored entries sharing its cache key (already filtered by the
    /// caller's `get_entries`). `now` drives every freshness computation.
    pub fn next<E: CachedEntry>(&self, request: &Request, candidates: Vec<E>, now: SystemTime) -> IdleDecision<E> {
        let req_cc = parse_cache_control(request.headers.get_all(http::header::CACHE_CONTROL));
        let only_if_cached = has_directive(&req_cc, "only-if-cached");

        if !self.options.supported_methods.contains(&request.method) || request.has_no_store() {
            return IdleDecision::CacheMiss(CacheMiss { request: request.clone() });
        }

        let surviving: Vec<E> = candidates
            .into_iter()
            .filter(|e| match vary::capture_vary_key(e.response_headers(), e.request_headers()) {
                Some(key) => vary::vary_matches(&key, &request.headers),
                None => false,
            })
            .collect();

        if surviving.is_empty() {
            return IdleDecision::CacheMiss(CacheMiss { request: request.clone() });
        }

        let wants_revalidation = has_directive(&req_cc, "no-cache")
            || directive_seconds(&req_cc, "max-age") == Some(0)
            || self.options.always_revalidate;

        let min_fresh = directive_seconds(&req_cc, "min-fresh").map(std::time::Duration::from_secs).unwrap_or_default();

        let freshest = surviving
            .iter()
            .enumerate()
            .filter(|(_, e)| {
                let lifetime = freshness_lifetime(*e, &self.options);
                let inputs = freshness_inputs(*e);
                !freshness::is_stale(lifetime, &inputs, now)
                    && freshness::time_to_live(lifetime, &inputs, now) >= min_fresh
            })
            .max_by_key(|(_, e)| e.created_at());

        if let (false, Some((idx, _))) = (wants_revalidation, freshest) {
            let mut surviving = surviving;
            let entry = surviving.swap_remove(idx);
            return IdleDecision::FromCache(FromCache { entry, stale: false });
        }

        if !wants_revalidation {
            if let Some(tolerance) = stale_tolerance_directive(&req_cc, "max-stale") {
                let stale_but_tolerated = surviving
                    .iter()
                    .enumerate()
                    .filter(|(_, e)| {
                        let lifetime = freshness_lifetime(*e, &self.options);
                        let inputs = freshness_inputs(*e);
                        if !freshness::is_stale(lifetime, &inputs, now) || min_fresh > std::time::Duration::ZERO {
                            return false;
                        }
                        let resp_cc = parse_cache_control(e.response_headers().get_all(http::header::CACHE_CONTROL));
                        let blocks_stale = has_directive(&resp_cc, "must-revalidate")
                            || (self.options.shared && has_directive(&resp_cc, "proxy-revalidate"));
                        !blocks_stale && tolerance.permits(freshness::overstaleness(lifetime, &inputs, now))
                    })
                    .max_by_key(|(_, e)| e.created_at());
                if let Some((idx, _)) = stale_but_tolerated {
                    let mut surviving = surviving;
                    let entry = surviving.swap_remove(idx);
                    return IdleDecision::FromCache(FromCache { entry, stale: true });
                }
            }
        }

        // `only-if-cached` forbids contacting the origin, so a stale entry
        // with a validator does not "qualify" under that directive: only a
        // fresh hit (handled above) satisfies the request.
        if !only_if_cached && (surviving.iter().any(|e| has_validator(e.response_headers())) || self.options.allow_stale) {
            let conditional_request = build_conditional(request, &surviving);
            return IdleDecision::NeedRevalidation(NeedRevalidation {
                conditional_request,
                original_request: request.clone(),
                revalidating_entries: surviving,
            });
        }

        IdleDecision::CacheMiss(CacheMiss { request: request.clone() })
    }
}

fn build_conditional<E: CachedEntry>(request: &Request, entries: &[E]) -> Request {
    // Multiple surviving candidates (distinct Vary'd representations) can
    // each carry their own validator; combine them into one synthetic
    // "stored" header set so `revalidation::build_conditional_headers`
    // handles weak-validator and If-Range stripping the same way it would
    // for a single candidate.
    let mut combined = HeaderMap::new();
    let etags: Vec<&str> = entries
        .iter()
        .filter_map(|e| e.response_headers().get(ETAG).and_then(|v| v.to_str().ok()))
        .collect();
    if !etags.is_empty() {
        if let Ok(v) = http::HeaderValue::from_str(&etags.join(", ")) {
            combined.insert(ETAG, v);
        }
    } else if let Some(last_modified) = entries
        .iter()
        .filter_map(|e| e.response_headers().get(LAST_MODIFIED).and_then(|v| v.to_str().ok()))
        .max()
    {
        if let Ok(v) = http::HeaderValue::from_str(last_modified) {
            combined.insert(LAST_MODIFIED, v);
        }
    }
    let headers = revalidation::build_conditional_headers(&request.method, request.headers.clone(), &combined);
    let mut conditional = Request::new(request.method.clone(), request.url.clone(), headers);
    conditional.metadata = request.metadata.clone();
    conditional
}

/// No usable cached response; an unconditional request to the origin is required.
#[derive(Debug, Clone)]
pub struct CacheMiss {
    /// The request to send to the origin.
    pub request: Request,
}

/// The outcome of [`CacheMiss::next`].
pub enum CacheMissDecision {
    /// The response is storable; persist and serve it.
    StoreAndUse(StoreAndUse),
    /// The response must not be stored; serve it without caching it.
    CouldNotBeStored(CouldNotBeStored),
}

impl CacheMiss {
    /// Decides storability for the origin's `response` to this miss's request.
    pub fn next(&self, response: &Response, options: &CacheOptions) -> CacheMissDecision {
        let spec_ignore = self.request.metadata.spec_ignore;
        if storability::is_storable(
            &self.request.method,
            response.status,
            &self.request.headers,
            &response.headers,
            options,
            spec_ignore,
        ) {
            CacheMissDecision::StoreAndUse(StoreAndUse { spec_ignored: spec_ignore })
        } else {
            CacheMissDecision::CouldNotBeStored(CouldNotBeStored)
        }
    }
}

/// A conditional request has been built and is awaiting the origin's answer.
pub struct NeedRevalidation<E: CachedEntry> {
    /// The conditional (If-None-Match / If-Modified-Since) request to send.
    pub conditional_request: Request,
    /// The request that originally triggered this lookup.
    pub original_request: Request,
    /// The stale candidates this revalidation may freshen or invalidate.
    pub revalidating_entries: Vec<E>,
}

/// The outcome of [`NeedRevalidation::next`].
pub enum RevalidationOutcome<E: CachedEntry> {
    /// A 304 selected one of the revalidating entries; freshen it.
    NeedToBeUpdated(NeedToBeUpdated<E>),
    /// The revalidating entries must be removed before re-evaluating as a fresh miss.
    InvalidatePairs(InvalidatePairs),
    /// A 5xx arrived and `allow_stale`/stale-if-error permits reuse.
    StaleOnError(FromCache<E>),
    /// The response was treated as an ordinary (non-304) answer to the original request.
    Resolved(CacheMissDecision),
}

impl<E: CachedEntry> NeedRevalidation<E> {
    /// Feeds the origin's `response` to the conditional request into the
    /// state machine. `now` drives the `stale-if-error` tolerance check on
    /// the 5xx branch.
    pub fn next(self, response: &Response, options: &CacheOptions, now: SystemTime) -> RevalidationOutcome<E> {
        if response.status == StatusCode::NOT_MODIFIED {
            let matched_idx = self
                .revalidating_entries
                .iter()
                .position(|e| revalidation::selects_stored_entry(e.response_headers(), &response.headers));
            return match matched_idx {
                Some(idx) => {
                    let mut entries = self.revalidating_entries;
                    let matched = entries.swap_remove(idx);
                    RevalidationOutcome::NeedToBeUpdated(NeedToBeUpdated {
                        matched,
                        headers_from: response.headers.clone(),
                    })
                }
                None => RevalidationOutcome::InvalidatePairs(InvalidatePairs {
                    ids: self.revalidating_entries.iter().map(|e| e.id()).collect(),
                }),
            };
        }

        if response.status.is_success() || response.status.is_redirection() {
            return RevalidationOutcome::InvalidatePairs(InvalidatePairs {
                ids: self.revalidating_entries.iter().map(|e| e.id()).collect(),
            });
        }

        if response.status.is_server_error() && options.allow_stale {
            let req_cc = parse_cache_control(self.original_request.headers.get_all(http::header::CACHE_CONTROL));
            if let Some(stalest) = self.revalidating_entries.into_iter().min_by_key(|e| e.created_at()) {
                let resp_cc = parse_cache_control(stalest.response_headers().get_all(http::header::CACHE_CONTROL));
                let tolerance = stale_tolerance_directive(&resp_cc, "stale-if-error")
                    .or_else(|| stale_tolerance_directive(&req_cc, "stale-if-error"));
                if let Some(tolerance) = tolerance {
                    let lifetime = freshness_lifetime(&stalest, options);
                    let inputs = freshness_inputs(&stalest);
                    if tolerance.permits(freshness::overstaleness(lifetime, &inputs, now)) {
                        return RevalidationOutcome::StaleOnError(FromCache { entry: stalest, stale: true });
                    }
                }
            }
        }

        let miss = CacheMiss { request: self.original_request };
        RevalidationOutcome::Resolved(miss.next(response, options))
    }
}

/// A 304 matched a stored entry; its headers must be merged before serving.
pub struct NeedToBeUpdated<E: CachedEntry> {
    /// The stored entry selected by the 304's validators.
    pub matched: E,
    /// The 304 response's headers, to merge onto the stored entry.
    pub headers_from: HeaderMap,
}

impl<E: CachedEntry> NeedToBeUpdated<E> {
    /// Computes the merged header set for the matched entry (S4.6). The
    /// caller (the proxy) is responsible for persisting this via
    /// `StorageEngine::update_entry` and bumping `created_at`.
    pub fn next(&self) -> HeaderMap {
        revalidation::merge_304_headers(self.matched.response_headers(), &self.headers_from)
    }
}

/// A cached response should be served as-is.
pub struct FromCache<E: CachedEntry> {
    /// The entry being served.
    pub entry: E,
    /// `true` if this entry was stale when served: either the request's
    /// `max-stale` tolerance admitted it directly, or a 5xx revalidation
    /// attempt fell back to it under `stale-if-error`.
    pub stale: bool,
}

/// The response from a cache-miss request should be stored and returned to the caller.
pub struct StoreAndUse {
    /// `true` if storability checks were bypassed via `hishel_spec_ignore`.
    pub spec_ignored: bool,
}

/// The response from a cache-miss request must not be stored.
pub struct CouldNotBeStored;

/// Entries named by `ids` must be removed before continuing.
pub struct InvalidatePairs {
    /// Entry identifiers to remove (soft-delete) before re-evaluating the
    /// original request as a fresh [`CacheMiss`].
    pub ids: HashSet<Uuid>,
}
