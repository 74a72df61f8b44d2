//! Exponential backoff with jitter.
//!
//! One formula serves both retrying tries and the outbox processors:
//! `initial * 2^(attempt - 1)`, jittered by ±20%, never below 100 ms.

use std::time::Duration;

use rand::Rng;

/// Lower bound on any computed delay.
pub const MIN_DELAY: Duration = Duration::from_millis(100);

const JITTER: f64 = 0.2;

/// Delay before the given attempt (1-based: attempt 1 is the first retry).
#[must_use]
pub fn delay_for_attempt(initial: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(32);
    let base = initial.saturating_mul(2u32.saturating_pow(exponent));
    jittered(base)
}

/// Apply ±20% jitter and the 100 ms floor.
#[must_use]
pub fn jittered(base: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(1.0 - JITTER..=1.0 + JITTER);
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let millis = (base.as_millis() as f64 * factor) as u64;
    Duration::from_millis(millis).max(MIN_DELAY)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_per_attempt_within_jitter_bounds() {
        let initial = Duration::from_secs(1);
        for attempt in 1..=6u32 {
            let base = initial.as_millis() as f64 * 2f64.powi(attempt as i32 - 1);
            let delay = delay_for_attempt(initial, attempt).as_millis() as f64;
            assert!(
                delay >= base * 0.8 && delay <= base * 1.2,
                "attempt {attempt}: {delay} outside [{}, {}]",
                base * 0.8,
                base * 1.2
            );
        }
    }

    #[test]
    fn never_below_the_floor() {
        for attempt in 1..=3u32 {
            let delay = delay_for_attempt(Duration::from_millis(1), attempt);
            assert!(delay >= MIN_DELAY);
        }
        assert!(jittered(Duration::ZERO) >= MIN_DELAY);
    }

    #[test]
    fn exponent_is_capped() {
        // A huge attempt index must not overflow.
        let delay = delay_for_attempt(Duration::from_secs(1), u32::MAX);
        assert!(delay > Duration::ZERO);
    }
}
