//! Shared exponential backoff schedule for transient dependency failures.
//!
//! One schedule serves vector upserts, summariser calls, and embedder calls:
//! 500 ms base doubling per attempt, capped at 30 s, at most 5 attempts.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};

pub const BASE_BACKOFF_MS: u64 = 500;
pub const MAX_BACKOFF_MS: u64 = 30_000;
pub const MAX_ATTEMPTS: usize = 5;

static JITTER_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Returns the deterministic backoff for a zero-based attempt index.
pub fn next_backoff_ms(attempt: usize) -> u64 {
    let shift = attempt.min(16) as u32;
    BASE_BACKOFF_MS
        .saturating_mul(1_u64 << shift)
        .min(MAX_BACKOFF_MS)
}

/// Process-wide jitter source: a counter pushed through SipHash so
/// concurrent retriers do not march in lockstep.
fn next_jitter_seed() -> u64 {
    let mut hasher = DefaultHasher::new();
    JITTER_COUNTER.fetch_add(1, Ordering::Relaxed).hash(&mut hasher);
    hasher.finish()
}

/// Returns the backoff with bounded jitter in [50%, 100%] of the deterministic value.
pub fn next_backoff_ms_with_jitter(attempt: usize) -> u64 {
    let base = next_backoff_ms(attempt);
    if base <= 1 {
        return base;
    }
    let floor = base / 2;
    let span = base - floor + 1;
    floor + next_jitter_seed() % span
}

#[cfg(test)]
mod tests {
    use super::{next_backoff_ms, next_backoff_ms_with_jitter, MAX_ATTEMPTS};

    #[test]
    fn backoff_doubles_then_caps() {
        assert_eq!(next_backoff_ms(0), 500);
        assert_eq!(next_backoff_ms(1), 1_000);
        assert_eq!(next_backoff_ms(2), 2_000);
        assert_eq!(next_backoff_ms(5), 16_000);
        assert_eq!(next_backoff_ms(6), 30_000);
        assert_eq!(next_backoff_ms(60), 30_000);
    }

    #[test]
    fn jittered_backoff_stays_within_expected_bounds() {
        let attempt = 3;
        let base = next_backoff_ms(attempt);
        let low = base / 2;
        for _ in 0..64 {
            let value = next_backoff_ms_with_jitter(attempt);
            assert!(value >= low, "expected {value} >= {low}");
            assert!(value <= base, "expected {value} <= {base}");
        }
    }

    #[test]
    fn attempt_budget_is_five() {
        assert_eq!(MAX_ATTEMPTS, 5);
    }
}
