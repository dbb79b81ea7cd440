//! # Retry with Exponential Backoff
//!
//! Backoff policy object injected into the claim coordinator's retry
//! helper, testable independently of network timing.
//!
//! ## Design
//!
//! - Exponential: `delay = initial_delay_ms * multiplier^(attempt-1)`,
//!   clamped to `max_delay_ms`.
//! - Deterministic jitter: `(attempt * 7919 + 104729) % (base/4 + 1)`;
//!   reproducible, no clock, no RNG.
//! - Retryability is decided by the caller-supplied predicate on the
//!   typed error, not by string matching.
//! - Non-retryable errors short-circuit on the first attempt.
//! - Every retry path sleeps; no busy loop.

use std::future::Future;

// ════════════════════════════════════════════════════════════════════════════
// POLICY
// ════════════════════════════════════════════════════════════════════════════

/// Configuration for retry-with-backoff behaviour.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the first).
    pub max_retries: u32,
    /// Base delay for the first retry (milliseconds).
    pub initial_delay_ms: u64,
    /// Upper bound for the computed delay (milliseconds).
    pub max_delay_ms: u64,
    /// Multiplicative factor applied per attempt.
    pub backoff_multiplier: f64,
    /// Whether to add deterministic jitter to each delay.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay_ms: 1000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Schedule used while waiting out the chain's visibility window on
    /// claim confirmation: 800 → 1600 → 3200 → 6400 ms, capped at 6.5 s.
    #[must_use]
    pub fn claim_confirmation() -> Self {
        Self {
            max_retries: 5,
            initial_delay_ms: 800,
            max_delay_ms: 6_500,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Outcome of a retried operation. `Exhausted` keeps the typed last
/// error so the caller can distinguish "still pending" from "failed".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryResult<T, E> {
    Success { value: T, attempts: u32 },
    Exhausted { last_error: E, attempts: u32 },
}

// ════════════════════════════════════════════════════════════════════════════
// DELAY COMPUTATION (pure)
// ════════════════════════════════════════════════════════════════════════════

/// Delay in milliseconds for a given attempt (1-indexed).
///
/// All arithmetic is clamped; NaN/Inf multipliers degrade to 0 or the
/// cap instead of panicking.
#[must_use]
pub fn compute_delay(config: &RetryConfig, attempt: u32) -> u64 {
    let exponent = attempt.saturating_sub(1);
    let multiplier_power = config.backoff_multiplier.powi(exponent as i32);
    let base_f64 = (config.initial_delay_ms as f64) * multiplier_power;

    let max = config.max_delay_ms as f64;
    let clamped = if base_f64.is_nan() || base_f64 < 0.0 {
        0.0
    } else if base_f64 > max {
        max
    } else {
        base_f64
    };

    let mut delay = clamped as u64;

    if config.jitter && delay > 0 {
        let quarter = delay / 4;
        if quarter > 0 {
            let attempt_u64 = u64::from(attempt);
            let jitter_val =
                (attempt_u64.wrapping_mul(7919).wrapping_add(104_729)) % (quarter + 1);
            delay = delay.saturating_add(jitter_val);
            if delay > config.max_delay_ms {
                delay = config.max_delay_ms;
            }
        }
    }

    delay
}

// ════════════════════════════════════════════════════════════════════════════
// RETRY DRIVER
// ════════════════════════════════════════════════════════════════════════════

/// Execute an async operation with exponential backoff.
///
/// `retryable` decides per error whether waiting can help; a `false`
/// verdict short-circuits immediately with the error as `Exhausted`.
/// The driver holds no state between attempts; idempotency is the
/// operation's own concern (for claims, the receipt constraint).
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    retryable: impl Fn(&E) -> bool,
    mut operation: F,
) -> RetryResult<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempts: u32 = 0;

    loop {
        attempts = attempts.saturating_add(1);

        match operation().await {
            Ok(value) => return RetryResult::Success { value, attempts },
            Err(e) => {
                if !retryable(&e) || attempts >= config.max_retries {
                    return RetryResult::Exhausted {
                        last_error: e,
                        attempts,
                    };
                }

                let delay_ms = compute_delay(config, attempts);
                if delay_ms > 0 {
                    tokio::time::sleep(tokio::time::Duration::from_millis(delay_ms)).await;
                }
            }
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════
// UNIT TESTS
// ════════════════════════════════════════════════════════════════════════════
