//! All counters use `Relaxed` ordering. Individual counter values are
//! eventually consistent. Cross-counter snapshots may be transiently
//! inconsistent (e.g., pool bytes may briefly disagree with live pool
//! count). This is acceptable for diagnostic display.
//! Do NOT use these values for allocation decisions.

use crate::sync::atomic::{AtomicIsize, Ordering};

/// Diagnostic-only gauge counter.
///
/// Under contention, subtract-before-add races are tolerated and the raw value
/// may transiently dip below zero. Readers should always use `load()`/`get()`,
/// which clamp negative values to zero.
pub struct Counter(AtomicIsize);

impl Counter {
    #[cfg(not(loom))]
    pub const fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[cfg(loom)]
    pub fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[inline]
    #[allow(clippy::cast_possible_wrap)]
    fn delta(val: usize) -> isize {
        // Diagnostic counters only: clamp absurd deltas instead of panicking.
        std::cmp::min(val, isize::MAX as usize) as isize
    }

    #[inline]
    pub fn add(&self, val: usize) {
        self.0.fetch_add(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    pub fn sub(&self, val: usize) {
        self.0.fetch_sub(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    #[allow(dead_code)]
    pub fn get(&self) -> usize {
        self.load(Ordering::Relaxed)
    }

    #[inline]
    #[allow(clippy::cast_sign_loss)]
    pub fn load(&self, ordering: Ordering) -> usize {
        self.0.load(ordering).max(0) as usize
    }
}

// OS bytes currently held in token pools (pool regions, live or empty)
crate::sync::static_atomic! {
    pub static POOL_BYTES: Counter = Counter::new();
}
// Token pools currently held
crate::sync::static_atomic! {
    pub static POOLS_LIVE: Counter = Counter::new();
}

// Oversize allocations served directly by the OS
crate::sync::static_atomic! {
    pub static EXTERNAL_BYTES: Counter = Counter::new();
}
crate::sync::static_atomic! {
    pub static EXTERNAL_LIVE: Counter = Counter::new();
}

/// Best-effort subtract from a diagnostic atomic counter.
///
/// Uses a single atomic subtraction (no TOCTOU load-then-subtract race).
/// Readers clamp negative transients via `Counter::load`.
pub fn sub_saturating(counter: &Counter, val: usize) {
    counter.sub(val);
}

/// Snapshot of the process-wide gauges.
pub struct MemoryGauges {
    pub pool_bytes: usize,
    pub pools_live: usize,
    pub external_bytes: usize,
    pub external_live: usize,
}

impl MemoryGauges {
    #[must_use]
    pub fn snapshot() -> Self {
        Self {
            pool_bytes: POOL_BYTES.load(Ordering::Relaxed),
            pools_live: POOLS_LIVE.load(Ordering::Relaxed),
            external_bytes: EXTERNAL_BYTES.load(Ordering::Relaxed),
            external_live: EXTERNAL_LIVE.load(Ordering::Relaxed),
        }
    }
}
