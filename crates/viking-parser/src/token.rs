//! Approximate token counting.
//!
//! Splitting decisions use one deterministic counter everywhere so the same
//! input always produces the same tree. The default approximation is
//! 1 token ≈ 4 characters, rounded up.

/// Pluggable token counter used by splitting decisions.
pub trait TokenCounter: Send + Sync {
    fn count(&self, text: &str) -> usize;
}

/// Deterministic `ceil(chars / 4)` approximation.
#[derive(Debug, Clone, Copy, Default)]
pub struct ApproxTokenCounter;

impl TokenCounter for ApproxTokenCounter {
    fn count(&self, text: &str) -> usize {
        text.chars().count().div_ceil(4)
    }
}
