//! `Vary` header matching (RFC 9111 S4.1).
//!
//! A stored response's selected representation is identified by the values
//! its `Vary`-named request headers had at store time. On a later request we
//! compare the same header names from the new request against the stored
//! values; any mismatch, or a `Vary: *`, means the stored entry does not
//! match and a fresh request must be made.

use http::HeaderMap;

use crate::model::canonical_joined_header;

/// The `Vary`-named header values captured from the request that created a
/// stored entry, keyed by lowercase header name.
pub type VaryKey = std::collections::BTreeMap<String, Option<String>>;

/// Builds the [`VaryKey`] for a request/response pair at store time. Returns
/// `None` if the response's `Vary` is `*`, meaning the entry can never be
/// matched again and must not be used to satisfy future requests without
/// revalidation.
pub fn capture_vary_key(response_headers: &HeaderMap, request_headers: &HeaderMap) -> Option<VaryKey> {
    let mut key = VaryKey::new();
    for raw_name in response_headers.get_all(http::header::VARY).iter().filter_map(|v| v.to_str().ok()) {
        for name in raw_name.split(',') {
            let name = name.trim();
            if name == "*" {
                return None;
            }
            if name.is_empty() {
                continue;
            }
            let name = name.to_ascii_lowercase();
            let header_name = match http::HeaderName::from_bytes(name.as_bytes()) {
                Ok(n) => n,
                Err(_) => continue,
            };
            let value = canonical_joined_header(request_headers, &header_name);
            key.insert(name, value);
        }
    }
    Some(key)
}

/// `true` if `request_headers` reproduces the selecting header values
/// captured in `key` (S4.1's "secondary cache key").
pub fn vary_matches(key: &VaryKey, request_headers: &HeaderMap) -> bool {
    key.iter().all(|(name, stored_value)| {
        let current = http::HeaderName::from_bytes(name.as_bytes())
            .ok()
            .and_then(|header_name| canonical_joined_header(request_headers, &header_name));
        &current == stored_value
    })
}
