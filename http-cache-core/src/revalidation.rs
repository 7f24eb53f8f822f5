//! Building conditional requests and merging 304 responses (RFC 9111 S4.3).

use http::header::{
    ACCEPT_RANGES, ETAG, IF_MATCH, IF_MODIFIED_SINCE, IF_NONE_MATCH, IF_RANGE, IF_UNMODIFIED_SINCE, LAST_MODIFIED,
};
use http::{HeaderMap, Method};

/// Headers excluded from the 304 header-merge because they describe the
/// entity body, which a 304 never carries a fresh copy of.
const EXCLUDED_FROM_REVALIDATION_UPDATE: &[&str] =
    &["content-length", "content-encoding", "transfer-encoding", "content-range"];

/// Builds the conditional headers (`If-None-Match`, `If-Modified-Since`) to
/// add to a revalidation request, given the stored response's validators.
///
/// `If-Range` is always stripped: partial-content revalidation is outside
/// this cache's understanding (it does not store 206 responses).
pub fn build_conditional_headers(method: &Method, mut headers: HeaderMap, stored_response_headers: &HeaderMap) -> HeaderMap {
    headers.remove(IF_RANGE);

    if let Some(etag) = stored_response_headers.get(ETAG) {
        headers.insert(IF_NONE_MATCH, etag.clone());
    }

    let forbids_weak_validators =
        *method != Method::GET || headers.contains_key(ACCEPT_RANGES) || headers.contains_key(IF_MATCH) || headers.contains_key(IF_UNMODIFIED_SINCE);

    if forbids_weak_validators {
        headers.remove(IF_MODIFIED_SINCE);
        let keep = headers
            .get(IF_NONE_MATCH)
            .and_then(|v| v.to_str().ok())
            .map(|v| !v.trim_start().starts_with("W/"))
            .unwrap_or(false);
        if !keep {
            headers.remove(IF_NONE_MATCH);
        }
    } else if !headers.contains_key(IF_MODIFIED_SINCE) {
        if let Some(last_modified) = stored_response_headers.get(LAST_MODIFIED) {
            headers.insert(IF_MODIFIED_SINCE, last_modified.clone());
        }
    }

    headers
}

/// `true` if a 304 response's validators select the same stored
/// representation, per S4.3.3's matching rules (strong validator, then weak,
/// then `Last-Modified`, then "no validator at all on either side").
pub fn selects_stored_entry(stored_headers: &HeaderMap, fresh_304_headers: &HeaderMap) -> bool {
    let old_etag = stored_headers.get(ETAG).and_then(|v| v.to_str().ok()).map(str::trim);
    let new_etag = fresh_304_headers.get(ETAG).and_then(|v| v.to_str().ok()).map(str::trim);
    let old_last_modified = stored_headers.get(LAST_MODIFIED).and_then(|v| v.to_str().ok()).map(str::trim);
    let new_last_modified = fresh_304_headers.get(LAST_MODIFIED).and_then(|v| v.to_str().ok()).map(str::trim);

    if let Some(new_etag) = new_etag.filter(|e| !e.starts_with("W/")) {
        return old_etag.map(|e| e.trim_start_matches("W/")) == Some(new_etag);
    }
    if let (Some(old), Some(new)) = (old_etag, new_etag) {
        return old.trim_start_matches("W/") == new.trim_start_matches("W/");
    }
    if old_last_modified.is_some() {
        return old_last_modified == new_last_modified;
    }
    old_etag.is_none() && new_etag.is_none() && old_last_modified.is_none() && new_last_modified.is_none()
}

/// Merges a 304's headers onto the stored response's headers (S4.3.4): every
/// header the 304 carries (other than the body-describing ones) replaces the
/// stored value; everything else is kept from the stored response.
pub fn merge_304_headers(stored_headers: &HeaderMap, fresh_304_headers: &HeaderMap) -> HeaderMap {
    let mut merged = HeaderMap::with_capacity(stored_headers.keys_len());
    for name in stored_headers.keys() {
        let name = name.clone();
        let old_value = stored_headers.get(&name).cloned();
        if let Some(new_value) = fresh_304_headers.get(&name) {
            if !EXCLUDED_FROM_REVALIDATION_UPDATE.contains(&name.as_str()) {
                merged.insert(name, new_value.clone());
                continue;
            }
        }
        if let Some(old_value) = old_value {
            merged.insert(name, old_value);
        }
    }
    for name in fresh_304_headers.keys() {
        if merged.contains_key(name) || stored_headers.contains_key(name) {
            continue;
        }
        if EXCLUDED_FROM_REVALIDATION_UPDATE.contains(&name.as_str()) {
            continue;
        }
        if let Some(new_value) = fresh_304_headers.get(name) {
            merged.insert(name.clone(), new_value.clone());
        }
    }
    merged
}
