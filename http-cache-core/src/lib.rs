#![forbid(unsafe_code)]
#![deny(missing_debug_implementations)]
//! A sans-I/O implementation of RFC 9111 HTTP caching semantics.
//!
//! This crate is the decision layer only: it parses `Cache-Control`
//! directives, computes freshness and age, matches `Vary`, builds
//! conditional requests, decides storability, and drives the result through
//! a [`storage_engine::StorageEngine`] and an origin collaborator via
//! [`proxy::AsyncCacheProxy`]. It performs no I/O of its own — every
//! transition method in [`state_machine`] is pure given its inputs,
//! including the current time, which callers always supply explicitly
//! (see [`clock`]).
//!
//! Concrete storage backends (SQLite, in-memory) live in the sibling
//! `http-cache-storage` crate, which depends on this one.

mod clock;
mod directives;
mod error;
mod freshness;
mod metadata;
mod model;
mod options;
mod policy;
mod proxy;
mod revalidation;
mod state_machine;
mod storability;
mod storage_engine;
mod vary;

pub use clock::{Clock, SystemClock};
pub use error::{CacheError, Result};
pub use metadata::{RequestMetadata, ResponseMetadata};
pub use model::{canonical_joined_header, canonicalize_field_value, Request, Response, HOP_BY_HOP_HEADERS};
pub use options::CacheOptions;
pub use policy::{FilterPolicy, Policy, RequestFilter, ResponseFilter};
pub use proxy::{cache_key, AsyncCacheProxy, ProxiedResponse, RequestSender};
#[cfg(feature = "blocking")]
pub use proxy::BlockingCacheProxy;
pub use storage_engine::{EntryUpdate, NewEntry, StorageEngine};

pub mod directives_api {
    //! Re-exports of the directive parsing helpers, for integrations that
    //! need to inspect `Cache-Control` outside the state machine.
    pub use crate::directives::{directive_seconds, format_cache_control, has_directive, parse_cache_control, CacheControl};
}

pub mod freshness_api {
    //! Re-exports of the freshness calculations, for integrations that want
    //! to surface age/TTL information without driving the full proxy.
    pub use crate::freshness::{current_age, is_stale, time_to_live, FreshnessInputs, Privacy, DEFAULT_HEURISTIC_FRACTION};
}

pub mod vary_api {
    //! Re-exports of the Vary matching helpers.
    pub use crate::vary::{capture_vary_key, vary_matches, VaryKey};
}

pub mod state_machine_api {
    //! Re-exports of the state machine's public types, kept under this
    //! namespace so `state_machine` itself can stay private and change
    //! shape without becoming part of the crate's stable surface.
    pub use crate::state_machine::{
        CacheMiss, CacheMissDecision, CachedEntry, CouldNotBeStored, FromCache, IdleClient, IdleDecision,
        InvalidatePairs, NeedRevalidation, NeedToBeUpdated, RevalidationOutcome, StoreAndUse,
    };
}
