//! Pluggable policy abstraction: RFC-compliant state-machine decisions, or a
//! user-supplied filter bypassing them entirely (S9's first open question).
//!
//! `SpecificationPolicy` drives [`crate::state_machine`] and is the only
//! policy most integrations need. `FilterPolicy` is a documented extension
//! point, not RFC-governed behavior: its predicates are AND-composed and
//! evaluated before storability checks, a choice recorded in this crate's
//! design notes rather than derived from the RFC.

use crate::model::{Request, Response};
use crate::options::CacheOptions;

/// A predicate over a request, used by [`FilterPolicy`].
pub type RequestFilter = std::sync::Arc<dyn Fn(&Request) -> bool + Send + Sync>;
/// A predicate over a response, used by [`FilterPolicy`].
pub type ResponseFilter = std::sync::Arc<dyn Fn(&Response) -> bool + Send + Sync>;

/// Selects between RFC 9111 decision logic and a user-supplied filter.
pub enum Policy {
    /// The full state-machine-driven RFC 9111 behavior.
    Specification(CacheOptions),
    /// Bypasses the state machine; storability and cacheability are decided
    /// by AND-composing `request_filters` and `response_filters`.
    Filter(FilterPolicy),
}

impl Policy {
    /// The RFC-compliant policy with `options`.
    pub fn specification(options: CacheOptions) -> Self {
        Self::Specification(options)
    }
}

/// A filter-based policy: caches a request/response pair iff every request
/// filter and every response filter passes.
#[derive(Clone, Default)]
pub struct FilterPolicy {
    /// Predicates a request must satisfy before the response is even sent.
    pub request_filters: Vec<RequestFilter>,
    /// Predicates a response must satisfy, evaluated before storability.
    pub response_filters: Vec<ResponseFilter>,
}

impl FilterPolicy {
    /// An empty filter policy: every request and response passes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a request predicate.
    pub fn with_request_filter(mut self, filter: RequestFilter) -> Self {
        self.request_filters.push(filter);
        self
    }

    /// Adds a response predicate.
    pub fn with_response_filter(mut self, filter: ResponseFilter) -> Self {
        self.response_filters.push(filter);
        self
    }

    /// `true` iff `request` passes every registered request filter.
    pub fn accepts_request(&self, request: &Request) -> bool {
        self.request_filters.iter().all(|f| f(request))
    }

    /// `true` iff `response` passes every registered response filter.
    /// Evaluated before the storability predicate would otherwise run.
    pub fn accepts_response(&self, response: &Response) -> bool {
        self.response_filters.iter().all(|f| f(response))
    }
}

impl std::fmt::Debug for FilterPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterPolicy")
            .field("request_filters", &self.request_filters.len())
            .field("response_filters", &self.response_filters.len())
            .finish()
    }
}
