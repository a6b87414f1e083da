//! Default retry delay computation.

use rand::Rng;
use std::time::Duration;

/// Base delay for the first retry.
const BASE: Duration = Duration::from_secs(15);

/// Upper bound on any computed delay.
const CAP: Duration = Duration::from_secs(24 * 60 * 60);

/// Exponential backoff with a hard cap and up to one second of jitter.
///
/// The delay doubles with each attempt, starting from [`BASE`] for the first
/// attempt and clamping at [`CAP`]. Jitter spreads out retries from jobs that
/// failed in the same instant, so a burst of failures does not produce a
/// burst of retries.
pub fn jittery_clamped(attempt: i32) -> Duration {
    let exponent = attempt.saturating_sub(1).clamp(0, 62) as u32;
    let raw = BASE
        .checked_mul(2u32.saturating_pow(exponent))
        .unwrap_or(CAP);

    raw.min(CAP) + Duration::from_millis(rand::rng().random_range(0..1000))
}
