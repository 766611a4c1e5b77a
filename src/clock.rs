//! Time source and decay math.
//!
//! Every timestamp in the engine is an epoch-millisecond `u64` drawn from an
//! injectable [`Clock`], so tests can drive time deterministically. The
//! recency curve and the default half-life scaling used by the decay policy
//! both live here.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Milliseconds in one day.
pub const DAY_MS: u64 = 24 * 60 * 60 * 1000;

/// A monotonic millisecond time source.
///
/// The engine never calls `Utc::now()` directly; all timestamps flow through
/// this trait so recall, decay and TTL behaviour are reproducible in tests.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Current time as epoch milliseconds.
    fn now_ms(&self) -> u64;
}

/// Wall-clock time source used in production.
#[derive(Debug, Default, Clone)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        chrono::Utc::now().timestamp_millis().max(0) as u64
    }
}

/// Manually advanced clock for deterministic tests.
///
/// Cloning shares the underlying counter, so a test can hold one handle and
/// hand another to the engine.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    /// Create a clock starting at the given epoch milliseconds.
    pub fn new(start_ms: u64) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(start_ms)),
        }
    }

    /// Advance the clock by the given number of milliseconds.
    pub fn advance(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }

    /// Advance the clock by whole days.
    pub fn advance_days(&self, days: u64) {
        self.advance(days * DAY_MS);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Exponential recency score in [0, 1].
///
/// `recency = exp(-ln(2) * age / half_life)`: 1.0 at the moment of access,
/// 0.5 after one half-life, approaching 0 as the item ages. A zero or
/// negative half-life degenerates to 0 for stale items and 1 for fresh ones.
pub fn recency(now_ms: u64, last_accessed_ms: u64, half_life_ms: f64) -> f64 {
    let age = now_ms.saturating_sub(last_accessed_ms) as f64;
    if half_life_ms <= 0.0 {
        return if age <= 0.0 { 1.0 } else { 0.0 };
    }
    (-std::f64::consts::LN_2 * age / half_life_ms).exp()
}

/// Default per-item half-life scaling from feedback counters.
///
/// `scale = 0.5 + 1.5 * success / (success + fail + 1)`, so items with a
/// perfect feedback record live several times longer than items that always
/// fail. This is the reference behaviour behind the default `decay` policy
/// expression; callers normally go through the policy layer rather than
/// calling this directly.
pub fn default_half_life_ms(success: u64, fail: u64, base_half_life_ms: f64) -> f64 {
    let total = (success + fail + 1) as f64;
    let ratio = success as f64 / total;
    let scale = 0.5 + 1.5 * ratio;
    base_half_life_ms * scale
}
