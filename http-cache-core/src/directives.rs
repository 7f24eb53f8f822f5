//! `Cache-Control` directive parsing (RFC 9111 S5.2).
//!
//! Directives are a flat map of token to optional value. A response with
//! more than one value for the same directive has "invalid freshness
//! information" (S5.2.2) and per that section caches are encouraged to
//! treat it as stale; we surface this by dropping the map entirely rather
//! than failing the request, matching the lenient-parse posture the rest of
//! the core takes toward malformed headers (no [`crate::error::CacheError`]
//! is ever raised here).

use std::collections::HashMap;
use std::collections::hash_map::Entry;

use http::HeaderValue;

/// Parsed `Cache-Control` directives: token -> optional value, unquoted.
pub type CacheControl = HashMap<Box<str>, Option<Box<str>>>;

/// Parses every `Cache-Control` header instance into a flat directive map.
///
/// Returns an empty map if any directive token repeats with a different
/// value, per S5.2.2's "invalid freshness information" rule.
pub fn parse_cache_control<'a>(headers: impl IntoIterator<Item = &'a HeaderValue>) -> CacheControl {
    let mut cc = CacheControl::new();
    let mut is_valid = true;

    for h in headers.into_iter().filter_map(|v| v.to_str().ok()) {
        for part in h.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let mut kv = part.splitn(2, '=');
            let k = kv.next().unwrap().trim().to_ascii_lowercase();
            if k.is_empty() {
                continue;
            }
            let v = kv.next().map(str::trim).map(|v| v.trim_matches('"'));
            match cc.entry(k.into_boxed_str()) {
                Entry::Occupied(e) => {
                    if e.get().as_deref() != v {
                        is_valid = false;
                    }
                }
                Entry::Vacant(e) => {
                    e.insert(v.map(Into::into));
                }
            }
        }
    }

    if is_valid { cc } else { CacheControl::new() }
}

/// Serializes a directive map back into a single `Cache-Control` field
/// value, quoting any value that isn't a bare alphanumeric token.
pub fn format_cache_control(cc: &CacheControl) -> String {
    let mut out = String::new();
    for (k, v) in cc {
        if !out.is_empty() {
            out.push_str(", ");
        }
        out.push_str(k);
        if let Some(v) = v {
            out.push('=');
            let needs_quote = v.is_empty() || v.as_bytes().iter().any(|b| !b.is_ascii_alphanumeric());
            if needs_quote {
                out.push('"');
            }
            out.push_str(v);
            if needs_quote {
                out.push('"');
            }
        }
    }
    out
}

/// Reads a directive's value as a non-negative integer number of seconds.
/// An unparsable or missing value is treated as the directive being absent,
/// matching the lenient posture of this module.
pub fn directive_seconds(cc: &CacheControl, name: &str) -> Option<u64> {
    cc.get(name)?.as_deref()?.parse().ok()
}

/// True if `name` is present in the map, regardless of its value.
pub fn has_directive(cc: &CacheControl, name: &str) -> bool {
    cc.contains_key(name)
}

/// A directive expressing tolerance for a stale response (`max-stale`,
/// `stale-if-error`): present with no value tolerates any amount of
/// staleness; present with a value bounds it to that many seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleTolerance {
    /// The directive carried no value.
    Unbounded,
    /// The directive's value, in seconds.
    Bounded(u64),
}

impl StaleTolerance {
    /// `true` if `overstaleness` (time past the freshness lifetime) is within
    /// this tolerance.
    pub fn permits(&self, overstaleness: std::time::Duration) -> bool {
        match self {
            StaleTolerance::Unbounded => true,
            StaleTolerance::Bounded(secs) => overstaleness <= std::time::Duration::from_secs(*secs),
        }
    }
}

/// Reads `name` as a stale-tolerance directive. A bare directive (no `=`, or
/// an unparsable value) is unbounded tolerance; a parseable seconds value is
/// a bound; an absent directive is `None`.
pub fn stale_tolerance_directive(cc: &CacheControl, name: &str) -> Option<StaleTolerance> {
    let value = cc.get(name)?;
    Some(match value.as_deref().and_then(|v| v.parse().ok()) {
        Some(secs) => StaleTolerance::Bounded(secs),
        None => StaleTolerance::Unbounded,
    })
}
