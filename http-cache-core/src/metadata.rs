//! Request and response metadata bags (S6.3, S6.4).
//!
//! The original design keyed these by magic strings in an untyped map; here
//! they're explicit, named, optional fields (S9's redesign note). Unknown
//! keys encountered while decoding an older bag are ignored rather than
//! rejected.

/// Request-scoped control inputs (S6.3). Each field is optional; absent
/// means "use the option default".
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct RequestMetadata {
    /// TTL override for the entry this request may create, in seconds.
    #[serde(default, rename = "hishel_ttl")]
    pub ttl: Option<f64>,
    /// Sliding (`true`) vs fixed (`false`) expiration on read.
    #[serde(default, rename = "hishel_refresh_ttl_on_access")]
    pub refresh_ttl_on_access: Option<bool>,
    /// Bypass RFC storability checks (but not `no-store`) if `true`.
    #[serde(default, rename = "hishel_spec_ignore")]
    pub spec_ignore: bool,
    /// Include the request body hash in the cache key if `true`.
    #[serde(default, rename = "hishel_body_key")]
    pub body_key: bool,
}

/// Response-observation outputs (S6.4), populated by the proxy and never by
/// the origin server.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct ResponseMetadata {
    /// Always present: whether this response was served from cache.
    #[serde(default, rename = "hishel_from_cache")]
    pub from_cache: bool,
    /// True iff a 304 freshened a stored entry, or a revalidation request to
    /// the origin completed successfully.
    #[serde(default, rename = "hishel_revalidated")]
    pub revalidated: bool,
    /// True iff this response was newly persisted.
    #[serde(default, rename = "hishel_stored")]
    pub stored: bool,
    /// True iff the S4.5 spec-ignore branch was taken for this response.
    #[serde(default, rename = "hishel_spec_ignored")]
    pub spec_ignored: bool,
    /// POSIX timestamp of the stored entry, if one exists.
    #[serde(default, rename = "hishel_created_at")]
    pub created_at: Option<f64>,
}
