//! Shared garbage-collection thresholds and the sweep-rate gate (§4.7).
//!
//! Both backends run the same cleanup rule; only the applies-the-rule code
//! (a `DELETE ... WHERE` for SQLite, a `retain`-style sweep for
//! `MemoryStorage`) differs. The rate gate is a last-fired timestamp
//! compared via compare-and-swap, the same idiom used to throttle outbound
//! requests, applied here to throttle GC sweeps instead.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Grace period soft-deleted entries remain visible to the GC before being
/// hard-deleted (I4).
pub const SOFT_DELETE_GRACE: Duration = Duration::from_secs(7 * 24 * 3600);

/// Age past which an incomplete entry (response never attached) or a
/// response stream missing its end-of-stream sentinel is considered
/// abandoned and hard-deleted.
pub const INCOMPLETE_ABANDON_AGE: Duration = Duration::from_secs(3600);

/// Minimum interval between opportunistic cleanup sweeps.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

fn epoch_secs(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

/// Rate-limits the cleanup sweep: `should_sweep(now)` returns `true` at most
/// once per [`SWEEP_INTERVAL`], regardless of how many concurrent callers
/// race to ask. The loser of the race just skips its sweep for this
/// operation; cleanup is opportunistic, not guaranteed per call.
#[derive(Debug, Default)]
pub struct SweepGate {
    last_swept_at: AtomicU64,
}

impl SweepGate {
    /// A gate that allows an immediate first sweep.
    pub fn new() -> Self {
        Self { last_swept_at: AtomicU64::new(0) }
    }

    /// `true` iff the caller won the race to run this sweep.
    pub fn should_sweep(&self, now: SystemTime) -> bool {
        let now_secs = epoch_secs(now);
        let last = self.last_swept_at.load(Ordering::Acquire);
        if now_secs.saturating_sub(last) < SWEEP_INTERVAL.as_secs() {
            return false;
        }
        self.last_swept_at.compare_exchange(last, now_secs, Ordering::AcqRel, Ordering::Acquire).is_ok()
    }
}

/// `true` if a soft-deleted-at `deleted_at` is old enough to hard-delete.
pub fn past_soft_delete_grace(deleted_at: SystemTime, now: SystemTime) -> bool {
    now.duration_since(deleted_at).map(|age| age >= SOFT_DELETE_GRACE).unwrap_or(false)
}

/// `true` if a `created_at` TTL-carrying entry has outlived its TTL.
pub fn past_ttl(created_at: SystemTime, now: SystemTime, ttl: Duration) -> bool {
    now.duration_since(created_at).map(|age| age >= ttl).unwrap_or(false)
}

/// `true` if an incomplete entry or sentinel-less stream created at
/// `created_at` has been abandoned.
pub fn past_abandon_age(created_at: SystemTime, now: SystemTime) -> bool {
    now.duration_since(created_at).map(|age| age >= INCOMPLETE_ABANDON_AGE).unwrap_or(false)
}
