//! Age and freshness lifetime calculations (RFC 9111 S4.2).
//!
//! All entry points take `now` explicitly so callers can drive this with a
//! fixed clock in tests; nothing in this module reads [`std::time::SystemTime::now`]
//! directly.

use std::time::{Duration, SystemTime};

use http::HeaderMap;
use http::header::{AGE, CACHE_CONTROL, DATE, EXPIRES, LAST_MODIFIED};

use crate::directives::{directive_seconds, has_directive, parse_cache_control};

/// Default heuristic freshness fraction applied to `Date - Last-Modified`
/// when neither `Expires` nor `max-age`/`s-maxage` is present (S4.2.2).
pub const DEFAULT_HEURISTIC_FRACTION: f64 = 0.1;

/// Whether this cache instance behaves as shared (observes `s-maxage` and
/// the `Set-Cookie` restriction) or private.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Privacy {
    /// A shared cache, e.g. a forward or reverse proxy serving multiple clients.
    #[default]
    Shared,
    /// A private, single-user cache (a browser cache or a single application's HTTP client).
    Private,
}

/// Computed freshness inputs for one stored response.
#[derive(Debug, Clone, Copy)]
pub struct FreshnessInputs {
    /// The `Date` header value, or the time the response was received if absent.
    pub date: SystemTime,
    /// The time this response was received from the origin (or revalidated).
    pub response_time: SystemTime,
    /// The `Age` header value at `response_time`, zero if absent.
    pub age_header: Duration,
}

impl FreshnessInputs {
    /// Reads `Date` and `Age` off a response's headers. `received_at` is used
    /// as the `Date` fallback per S4.2.1 when the header is absent or
    /// unparsable, and is always the stored `response_time`.
    pub fn from_headers(headers: &HeaderMap, received_at: SystemTime) -> Self {
        let date = headers
            .get(DATE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| httpdate::parse_http_date(v).ok())
            .unwrap_or(received_at);
        let age_header = headers
            .get(AGE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or_default();
        Self { date, response_time: received_at, age_header }
    }
}

/// The `current_age` algorithm of S4.2.3: `corrected_initial_age` plus
/// resident time in this cache.
pub fn current_age(inputs: &FreshnessInputs, now: SystemTime) -> Duration {
    let apparent_age = inputs
        .response_time
        .duration_since(inputs.date)
        .unwrap_or_default();
    let corrected_initial_age = apparent_age.max(inputs.age_header);
    let resident_time = now.duration_since(inputs.response_time).unwrap_or_default();
    corrected_initial_age + resident_time
}

/// The freshness lifetime of S4.2.1: explicit `s-maxage` (shared only),
/// `max-age`, `Expires`, or heuristic freshness, in that order. Returns zero
/// for responses with `Vary: *`, `no-cache`, or (shared cache with
/// `Set-Cookie` and no `public`/`immutable`) an un-opted-in cookie-bearing
/// response.
pub fn freshness_lifetime(
    headers: &HeaderMap,
    privacy: Privacy,
    date: SystemTime,
    immutable_min_ttl: Duration,
    heuristic_fraction: f64,
    allow_heuristics: bool,
) -> Duration {
    let cc = parse_cache_control(headers.get_all(CACHE_CONTROL));

    if has_directive(&cc, "no-cache") {
        return Duration::ZERO;
    }
    if headers.get("vary").and_then(|v| v.to_str().ok()).map(str::trim) == Some("*") {
        return Duration::ZERO;
    }
    if privacy == Privacy::Shared
        && headers.contains_key(http::header::SET_COOKIE)
        && !has_directive(&cc, "public")
        && !has_directive(&cc, "immutable")
    {
        return Duration::ZERO;
    }

    if privacy == Privacy::Shared {
        if let Some(s_maxage) = directive_seconds(&cc, "s-maxage") {
            return Duration::from_secs(s_maxage);
        }
    }

    if let Some(max_age) = directive_seconds(&cc, "max-age") {
        return Duration::from_secs(max_age);
    }

    let default_min_ttl = if has_directive(&cc, "immutable") { immutable_min_ttl } else { Duration::ZERO };

    if let Some(expires) = headers.get(EXPIRES).and_then(|v| v.to_str().ok()) {
        return match httpdate::parse_http_date(expires) {
            Err(_) => Duration::ZERO,
            Ok(expires) => default_min_ttl.max(expires.duration_since(date).unwrap_or_default()),
        };
    }

    if allow_heuristics {
        if let Some(last_modified) = headers.get(LAST_MODIFIED).and_then(|v| v.to_str().ok()) {
            if let Ok(last_modified) = httpdate::parse_http_date(last_modified) {
                if let Ok(since_modified) = date.duration_since(last_modified) {
                    let heuristic_secs = since_modified.as_secs_f64() * heuristic_fraction;
                    return default_min_ttl.max(Duration::from_secs_f64(heuristic_secs.max(0.0)));
                }
            }
        }
    }

    default_min_ttl
}

/// `true` once `current_age >= freshness_lifetime` (S4.2).
pub fn is_stale(freshness_lifetime: Duration, inputs: &FreshnessInputs, now: SystemTime) -> bool {
    current_age(inputs, now) >= freshness_lifetime
}

/// Remaining time until the entry becomes stale, zero if already stale.
pub fn time_to_live(freshness_lifetime: Duration, inputs: &FreshnessInputs, now: SystemTime) -> Duration {
    freshness_lifetime.checked_sub(current_age(inputs, now)).unwrap_or_default()
}

/// How far past its freshness lifetime this entry currently is, zero if not stale.
pub fn overstaleness(freshness_lifetime: Duration, inputs: &FreshnessInputs, now: SystemTime) -> Duration {
    current_age(inputs, now).saturating_sub(freshness_lifetime)
}
