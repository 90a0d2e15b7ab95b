//! Retry backoff: exponential with jitter.

use rand::Rng;
use std::time::Duration;

/// `min(2^attempt * base, cap)` scaled by a random factor in `0.5..1.5`.
pub fn delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let factor: f64 = rand::thread_rng().gen_range(0.5..1.5);
    delay_with_factor(attempt, base, cap, factor)
}

pub(crate) fn delay_with_factor(
    attempt: u32,
    base: Duration,
    cap: Duration,
    factor: f64,
) -> Duration {
    let exponent = attempt.min(20);
    let nominal = base
        .saturating_mul(1u32 << exponent.min(31))
        .min(cap);
    nominal.mul_f64(factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: Duration = Duration::from_secs(1);
    const CAP: Duration = Duration::from_secs(60);

    #[test]
    fn test_grows_exponentially_until_cap() {
        assert_eq!(delay_with_factor(0, BASE, CAP, 1.0), Duration::from_secs(1));
        assert_eq!(delay_with_factor(1, BASE, CAP, 1.0), Duration::from_secs(2));
        assert_eq!(delay_with_factor(3, BASE, CAP, 1.0), Duration::from_secs(8));
        assert_eq!(delay_with_factor(6, BASE, CAP, 1.0), Duration::from_secs(60));
        assert_eq!(delay_with_factor(20, BASE, CAP, 1.0), Duration::from_secs(60));
    }

    #[test]
    fn test_jitter_bounds() {
        for _ in 0..100 {
            let d = delay(1, BASE, CAP);
            assert!(d >= Duration::from_secs(1));
            assert!(d <= Duration::from_secs(3));
        }
    }

    #[test]
    fn test_first_retry_at_least_base() {
        // attempt 1 with minimum jitter factor is still >= base.
        let d = delay_with_factor(1, BASE, CAP, 0.5);
        assert_eq!(d, Duration::from_secs(1));
    }
}
