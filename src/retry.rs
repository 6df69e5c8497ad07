//! Exponential backoff retry for external calls (template upstream fetch,
//! pub.dev dependency-health lookups).
//!
//! Provides [`retry_with_backoff`] — a generic async helper that retries a
//! fallible operation with exponentially increasing, jittered delays between
//! attempts, gated by a caller-supplied predicate deciding which errors are
//! worth retrying at all.

use std::time::Duration;
use tracing::{debug, warn};

/// Configuration for [`retry_with_backoff`].
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the first try).
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_delay: Duration,
    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
    /// Multiplier applied to the previous delay on each retry.
    pub multiplier: f64,
    /// Jitter as a fraction of the computed delay (0.0-1.0).
    pub jitter_fraction: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter_fraction: 0.25,
        }
    }
}

impl RetryConfig {
    /// Policy for dependency-health lookups: initial 1s, multiplier 2, cap
    /// 30s, max 3 attempts.
    pub fn health_lookup() -> Self {
        Self::default()
    }

    /// Create a config suitable for quick unit tests (no real waiting).
    pub fn instant() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            multiplier: 2.0,
            jitter_fraction: 0.0,
        }
    }

    /// Create a config with a single attempt (no retries).
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
            jitter_fraction: 0.0,
        }
    }
}

/// Deterministic pseudo-jitter derived from `attempt` — avoids a `rand`
/// dependency for a small jitter spread. Returns a fraction in `[-0.5, 0.5)`.
fn pseudo_rand(attempt: u32) -> f64 {
    const A: u64 = 1_664_525;
    const C: u64 = 1_013_904_223;
    const M: u64 = 1u64 << 32;
    let state = A.wrapping_mul(attempt as u64).wrapping_add(C) % M;
    (state as f64 / M as f64) - 0.5
}

fn next_delay(attempt: u32, delay: Duration, config: &RetryConfig) -> Duration {
    let jitter_range = delay.as_millis() as f64 * config.jitter_fraction;
    let jittered = delay.as_millis() as f64 + pseudo_rand(attempt) * jitter_range;
    Duration::from_millis(jittered.max(0.0) as u64)
}

/// Retry an async operation with exponential backoff and jitter.
///
/// Calls `f()` up to `config.max_attempts` times. `should_retry` decides
/// whether a given error is worth retrying at all (e.g. only
/// `timeout`/`connection_reset`/`5xx`/`429` for pub.dev lookups) — a
/// non-retryable error short-circuits immediately regardless of attempts
/// remaining.
///
/// Returns `Ok(result)` on the first success, or `Err(last_error)` once
/// attempts are exhausted or a non-retryable error is hit.
///
/// # Panics
/// Panics if `config.max_attempts` is 0.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    should_retry: impl Fn(&E) -> bool,
    mut f: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Debug,
{
    assert!(
        config.max_attempts > 0,
        "RetryConfig.max_attempts must be at least 1"
    );

    let mut delay = config.initial_delay;
    let mut last_err: Option<E> = None;

    for attempt in 1..=config.max_attempts {
        match f().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(attempt, "retry succeeded");
                }
                return Ok(value);
            }
            Err(e) => {
                if attempt < config.max_attempts && should_retry(&e) {
                    let sleep_for = next_delay(attempt, delay, config).min(config.max_delay);
                    warn!(
                        attempt,
                        max = config.max_attempts,
                        delay_ms = sleep_for.as_millis(),
                        err = ?e,
                        "attempt failed — retrying"
                    );
                    tokio::time::sleep(sleep_for).await;
                    let next_ms = (delay.as_millis() as f64 * config.multiplier) as u128;
                    delay = Duration::from_millis(next_ms.min(config.max_delay.as_millis()) as u64);
                } else {
                    if attempt < config.max_attempts {
                        debug!(attempt, err = ?e, "non-retryable error — giving up early");
                    } else {
                        warn!(attempt, max = config.max_attempts, err = ?e, "all retry attempts exhausted");
                    }
                    last_err = Some(e);
                    break;
                }
            }
        }
    }

    Err(last_err.expect("retry loop ended without setting last_err"))
}
