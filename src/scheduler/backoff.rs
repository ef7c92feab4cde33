//! Retry backoff
//!
//! Exponential with ±25% jitter. The jitter matters more than it looks:
//! a fleet of items that all failed on the same host outage must not
//! come back as one synchronized wave.

use rand::Rng;
use std::time::Duration;

const JITTER_FRACTION: f64 = 0.25;

/// Delay before retry `attempt` (0-based): `base * 2^attempt`, jittered.
pub fn delay(base: Duration, attempt: u32) -> Duration {
    let exp = base.as_secs_f64() * 2f64.powi(attempt.min(16) as i32);
    let jitter = rand::thread_rng().gen_range(-JITTER_FRACTION..=JITTER_FRACTION);
    Duration::from_secs_f64((exp * (1.0 + jitter)).max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_doubles_within_jitter_bounds() {
        let base = Duration::from_secs(60);
        for attempt in 0..4 {
            let nominal = 60.0 * 2f64.powi(attempt as i32);
            for _ in 0..50 {
                let d = delay(base, attempt).as_secs_f64();
                assert!(d >= nominal * 0.75 - 1e-6, "attempt {}: {} too low", attempt, d);
                assert!(d <= nominal * 1.25 + 1e-6, "attempt {}: {} too high", attempt, d);
            }
        }
    }

    #[test]
    fn exponent_is_capped() {
        // Pathological attempt numbers must not overflow into years.
        let d = delay(Duration::from_secs(1), 1000);
        assert!(d <= Duration::from_secs((1 << 16) + (1 << 15)));
    }
}
