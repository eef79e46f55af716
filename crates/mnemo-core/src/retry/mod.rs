//! Retry backoff policy.
//!
//! A pure function of (retry count, task kind) plus a jitter draw:
//!
//! ```text
//! backoff = clamp(base[kind] * multiplier[kind]^retry_count, 0, max[kind]) * U(1 - f, 1 + f)
//! ```
//!
//! The RNG is a parameter so callers (and tests) control seeding.

use std::collections::HashMap;
use std::time::Duration;

use rand::Rng;

use mnemo_db::models::TaskKind;

/// Backoff parameters for one task kind.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffParams {
    /// First-retry delay in milliseconds.
    pub base_ms: u64,
    /// Upper clamp in milliseconds (before jitter).
    pub max_ms: u64,
    /// Exponential growth factor per retry.
    pub multiplier: f64,
    /// Jitter fraction: the draw is uniform in `[1 - f, 1 + f]`.
    pub jitter: f64,
}

impl BackoffParams {
    const fn new(base_ms: u64, max_ms: u64, multiplier: f64, jitter: f64) -> Self {
        Self {
            base_ms,
            max_ms,
            multiplier,
            jitter,
        }
    }
}

/// Per-kind retry policy table.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    params: HashMap<TaskKind, BackoffParams>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        let mut params = HashMap::new();
        params.insert(TaskKind::Observation, BackoffParams::new(500, 30_000, 2.0, 0.1));
        params.insert(TaskKind::Summarize, BackoffParams::new(1_000, 60_000, 2.0, 0.1));
        params.insert(TaskKind::Embedding, BackoffParams::new(2_000, 120_000, 2.0, 0.2));
        params.insert(TaskKind::VectorSync, BackoffParams::new(5_000, 300_000, 2.0, 0.3));
        params.insert(TaskKind::DocGen, BackoffParams::new(1_000, 60_000, 2.0, 0.1));
        params.insert(TaskKind::ContextGen, BackoffParams::new(1_000, 60_000, 2.0, 0.1));
        params.insert(TaskKind::SemanticSearch, BackoffParams::new(500, 30_000, 2.0, 0.1));
        params.insert(TaskKind::Compression, BackoffParams::new(1_000, 60_000, 2.0, 0.1));
        Self { params }
    }
}

impl RetryPolicy {
    /// The defaults with a single kind's parameters replaced (from the
    /// `retry.<kind>.*` configuration keys).
    pub fn with_override(mut self, kind: TaskKind, params: BackoffParams) -> Self {
        self.params.insert(kind, params);
        self
    }

    /// Parameters for a kind.
    pub fn params(&self, kind: TaskKind) -> BackoffParams {
        // Default table covers every kind; overrides only replace entries.
        self.params[&kind]
    }

    /// Compute the backoff delay before retry number `retry_count + 1`.
    ///
    /// `retry_count` is the number of attempts already failed, so the first
    /// retry (`retry_count = 0`) waits roughly `base`.
    pub fn backoff<R: Rng + ?Sized>(
        &self,
        kind: TaskKind,
        retry_count: u32,
        rng: &mut R,
    ) -> Duration {
        let p = self.params(kind);
        let raw = (p.base_ms as f64) * p.multiplier.powi(retry_count as i32);
        let clamped = raw.min(p.max_ms as f64);
        let factor = rng.random_range((1.0 - p.jitter)..=(1.0 + p.jitter));
        Duration::from_millis((clamped * factor).round() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn assert_within(policy: &RetryPolicy, kind: TaskKind, retry_count: u32, rng: &mut StdRng) {
        let p = policy.params(kind);
        let d = policy.backoff(kind, retry_count, rng).as_millis() as f64;
        let raw = (p.base_ms as f64) * p.multiplier.powi(retry_count as i32);
        let clamped = raw.min(p.max_ms as f64);
        let lo = clamped * (1.0 - p.jitter) - 1.0;
        let hi = clamped * (1.0 + p.jitter) + 1.0;
        assert!(
            d >= lo && d <= hi,
            "{kind} retry {retry_count}: {d} outside [{lo}, {hi}]"
        );
    }

    #[test]
    fn backoff_within_jitter_bounds_for_all_kinds() {
        let policy = RetryPolicy::default();
        let mut rng = StdRng::seed_from_u64(7);
        for kind in TaskKind::ALL {
            for retry_count in 0..8 {
                assert_within(&policy, kind, retry_count, &mut rng);
            }
        }
    }

    #[test]
    fn backoff_is_clamped_at_max() {
        let policy = RetryPolicy::default();
        let p = policy.params(TaskKind::Embedding);
        let mut rng = StdRng::seed_from_u64(11);
        // 2000 * 2^30 is far beyond max; the clamp must hold.
        let d = policy.backoff(TaskKind::Embedding, 30, &mut rng).as_millis() as f64;
        assert!(d <= (p.max_ms as f64) * (1.0 + p.jitter) + 1.0);
        assert!(d >= (p.max_ms as f64) * (1.0 - p.jitter) - 1.0);
    }

    #[test]
    fn backoff_grows_exponentially_before_clamp() {
        let policy = RetryPolicy::default();
        // Zero-jitter override makes growth exact.
        let policy = policy.with_override(
            TaskKind::Observation,
            BackoffParams {
                base_ms: 500,
                max_ms: 30_000,
                multiplier: 2.0,
                jitter: 0.0,
            },
        );
        let mut rng = StdRng::seed_from_u64(3);
        let d0 = policy.backoff(TaskKind::Observation, 0, &mut rng);
        let d1 = policy.backoff(TaskKind::Observation, 1, &mut rng);
        let d2 = policy.backoff(TaskKind::Observation, 2, &mut rng);
        assert_eq!(d0, Duration::from_millis(500));
        assert_eq!(d1, Duration::from_millis(1_000));
        assert_eq!(d2, Duration::from_millis(2_000));
    }

    #[test]
    fn seeded_rng_is_deterministic() {
        let policy = RetryPolicy::default();
        let a = policy.backoff(TaskKind::Summarize, 2, &mut StdRng::seed_from_u64(42));
        let b = policy.backoff(TaskKind::Summarize, 2, &mut StdRng::seed_from_u64(42));
        assert_eq!(a, b);
    }

    #[test]
    fn override_replaces_only_one_kind() {
        let policy = RetryPolicy::default().with_override(
            TaskKind::DocGen,
            BackoffParams {
                base_ms: 10,
                max_ms: 20,
                multiplier: 1.0,
                jitter: 0.0,
            },
        );
        assert_eq!(policy.params(TaskKind::DocGen).base_ms, 10);
        assert_eq!(policy.params(TaskKind::Summarize).base_ms, 1_000);
    }
}
