//! Storability predicate (RFC 9111 S3, as parameterized by `CacheOptions`
//! per the decision rule of S4.5).
//!
//! Unlike a fixed RFC-only implementation, the method and status-code
//! allowlists here are configuration (`CacheOptions::supported_methods`,
//! `CacheOptions::cacheable_status_codes`), not hardcoded constants. The
//! `no-store`/`private`/`Authorization` rules still follow RFC 9111 S3
//! directly.

use http::{HeaderMap, Method, StatusCode};

use crate::directives::{has_directive, parse_cache_control};
use crate::options::CacheOptions;

/// `true` if a response with these properties may be stored at all (S4.5).
/// `spec_ignore` bypasses every rule here except the request/response
/// `no-store` check, per S4.5's final paragraph.
pub fn is_storable(
    method: &Method,
    status: StatusCode,
    request_headers: &HeaderMap,
    response_headers: &HeaderMap,
    options: &CacheOptions,
    spec_ignore: bool,
) -> bool {
    let req_cc = parse_cache_control(request_headers.get_all(http::header::CACHE_CONTROL));
    let res_cc = parse_cache_control(response_headers.get_all(http::header::CACHE_CONTROL));

    if has_directive(&req_cc, "no-store") || has_directive(&res_cc, "no-store") {
        return false;
    }
    if spec_ignore {
        return true;
    }

    if !options.supported_methods.contains(method) {
        return false;
    }

    let status_cacheable =
        options.cacheable_status_codes.contains(&status.as_u16()) || options.heuristically_cacheable_status(status.as_u16());
    if !status_cacheable {
        return false;
    }

    if options.shared && has_directive(&res_cc, "private") {
        return false;
    }

    if options.shared && request_headers.contains_key(http::header::AUTHORIZATION) {
        let allows_authenticated = has_directive(&res_cc, "must-revalidate")
            || has_directive(&res_cc, "public")
            || has_directive(&res_cc, "s-maxage");
        if !allows_authenticated {
            return false;
        }
    }

    let has_explicit_freshness = response_headers.contains_key(http::header::EXPIRES)
        || has_directive(&res_cc, "max-age")
        || (options.shared && has_directive(&res_cc, "s-maxage"));

    has_explicit_freshness || options.heuristically_cacheable_status(status.as_u16())
}
