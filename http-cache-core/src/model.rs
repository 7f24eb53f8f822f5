//! The request/response model the caching core operates on.
//!
//! Everything here is plain, immutable data — no I/O, no body streaming.
//! Bodies are the storage engine's concern (see `http-cache-storage`); the
//! core only ever looks at method, URL, headers and the small metadata bags
//! of S6.3/S6.4.

use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use url::Url;

use crate::metadata::{RequestMetadata, ResponseMetadata};

/// Hop-by-hop headers that integrations must strip before handing a request
/// or response to the core (S6.2). The core itself never inspects them.
pub const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// An immutable HTTP request as seen by the caching core.
#[derive(Debug, Clone)]
pub struct Request {
    /// The request method, normalized to an uppercase ASCII token by `http::Method`.
    pub method: Method,
    /// The absolute request URL.
    pub url: Url,
    /// Request headers, case-insensitive and ordered.
    pub headers: HeaderMap,
    /// Request-scoped control metadata (S6.3).
    pub metadata: RequestMetadata,
}

impl Request {
    /// Builds a request, stripping hop-by-hop headers per S6.2.
    pub fn new(method: Method, url: Url, mut headers: HeaderMap) -> Self {
        strip_hop_by_hop(&mut headers);
        Self { method, url, headers, metadata: RequestMetadata::default() }
    }

    /// Returns the header value for `name`, if present.
    pub fn header(&self, name: &str) -> Option<&HeaderValue> {
        self.headers.get(name)
    }

    /// True if `Cache-Control: no-store` is present on this request.
    pub fn has_no_store(&self) -> bool {
        crate::directives::parse_cache_control(self.headers.get_all("cache-control"))
            .contains_key("no-store")
    }
}

/// An immutable HTTP response as seen by the caching core.
#[derive(Debug, Clone)]
pub struct Response {
    /// The response status code.
    pub status: StatusCode,
    /// Response headers, case-insensitive and ordered.
    pub headers: HeaderMap,
    /// Response-observation metadata the proxy populates (S6.4). Always
    /// `ResponseMetadata::default()` on a response freshly returned by an
    /// origin server; the proxy fills it in before handing the response back
    /// to its caller.
    pub metadata: ResponseMetadata,
}

impl Response {
    /// Builds a response, stripping hop-by-hop headers per S6.2.
    pub fn new(status: StatusCode, mut headers: HeaderMap) -> Self {
        strip_hop_by_hop(&mut headers);
        Self { status, headers, metadata: ResponseMetadata::default() }
    }
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
}

/// Collapses inner whitespace and trims a header value for Vary comparison
/// (S4.3) and for coalescing repeated same-name fields with `, `.
pub fn canonicalize_field_value(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut last_was_space = false;
    for ch in raw.trim().chars() {
        if ch.is_whitespace() {
            if !last_was_space {
                out.push(' ');
            }
            last_was_space = true;
        } else {
            out.push(ch);
            last_was_space = false;
        }
    }
    out
}

/// Joins all values of `name` in `headers` with `, `, applying
/// [`canonicalize_field_value`] to each before joining, per S4.3.
pub fn canonical_joined_header(headers: &HeaderMap, name: &HeaderName) -> Option<String> {
    let mut values = headers.get_all(name).iter().filter_map(|v| v.to_str().ok()).peekable();
    values.peek()?;
    Some(
        values
            .map(canonicalize_field_value)
            .collect::<Vec<_>>()
            .join(", "),
    )
}
