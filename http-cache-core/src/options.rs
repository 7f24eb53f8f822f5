//! Cache-wide configuration (S3's `CacheOptions`, supplemented per S3.1).

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use http::Method;

use crate::model::Request;

/// Plain-data configuration bag controlling the specification policy's
/// decisions: no builder macro, every field documents its own default.
#[derive(Clone)]
pub struct CacheOptions {
    /// Whether this cache is shared (observes `private`, `s-maxage`, and
    /// `Authorization` restrictions) or private. Default: `false`.
    pub shared: bool,
    /// Request methods this cache will ever look up or store. Default:
    /// `{GET, HEAD}`.
    pub supported_methods: HashSet<Method>,
    /// Whether a stale entry may be served under `allow_stale`/`stale-if-error`
    /// conditions rather than always revalidating or missing. Default: `false`.
    pub allow_stale: bool,
    /// Whether heuristic freshness (S4.2) applies to responses lacking
    /// explicit freshness information. Default: `false`.
    pub allow_heuristics: bool,
    /// Forces revalidation on every lookup, regardless of freshness. Default:
    /// `false`.
    pub always_revalidate: bool,
    /// Status codes storable without an explicit freshness header, subject
    /// to `allow_heuristics`. Deliberately narrower than RFC 9110's full
    /// cacheable-by-default list; callers who need the full list can extend
    /// it explicitly. Default: `{200, 301, 308}`.
    pub cacheable_status_codes: HashSet<u16>,
    /// Upper bound on the freshness lifetime this cache will honor,
    /// regardless of server-advertised freshness. Default: `None` (no cap).
    pub max_ttl: Option<Duration>,
    /// Override for canonical cache-key derivation (S4.8 step 1). When
    /// unset, the proxy's built-in `method|host|hash` scheme is used.
    pub cache_key: Option<Arc<dyn Fn(&Request) -> Vec<u8> + Send + Sync>>,
    /// Sliding (`true`) vs fixed (`false`) expiration on storage reads.
    /// Default: `false`.
    pub refresh_ttl_on_access: bool,
}

impl std::fmt::Debug for CacheOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheOptions")
            .field("shared", &self.shared)
            .field("supported_methods", &self.supported_methods)
            .field("allow_stale", &self.allow_stale)
            .field("allow_heuristics", &self.allow_heuristics)
            .field("always_revalidate", &self.always_revalidate)
            .field("cacheable_status_codes", &self.cacheable_status_codes)
            .field("max_ttl", &self.max_ttl)
            .field("cache_key", &self.cache_key.as_ref().map(|_| "<fn>"))
            .field("refresh_ttl_on_access", &self.refresh_ttl_on_access)
            .finish()
    }
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            shared: false,
            supported_methods: [Method::GET, Method::HEAD].into_iter().collect(),
            allow_stale: false,
            allow_heuristics: false,
            always_revalidate: false,
            cacheable_status_codes: [200, 301, 308].into_iter().collect(),
            max_ttl: None,
            cache_key: None,
            refresh_ttl_on_access: false,
        }
    }
}

impl CacheOptions {
    /// Status codes that may be stored heuristically when `allow_heuristics`
    /// is set and no explicit freshness information is present (RFC 9110
    /// S15.1's default-cacheable set).
    pub fn heuristically_cacheable_status(&self, status: u16) -> bool {
        const HEURISTIC_STATUSES: &[u16] = &[200, 203, 204, 206, 300, 301, 308, 404, 405, 410, 414, 501];
        self.allow_heuristics && HEURISTIC_STATUSES.contains(&status)
    }

    /// The freshness lifetime privacy mode implied by `shared`.
    pub fn privacy(&self) -> crate::freshness::Privacy {
        if self.shared { crate::freshness::Privacy::Shared } else { crate::freshness::Privacy::Private }
    }
}
