//! Jitter for retry delays
//!
//! Spreads out retries from several servers that failed at the same moment
//! (e.g. during a store outage) so they do not hit the store in lockstep.

use rand::Rng;
use std::time::Duration;

/// Add up to `jitter_percent` percent of `delay` on top of `delay`
///
/// # Examples
/// ```
/// use std::time::Duration;
/// use taskmanager_extensions::utils::jittered;
///
/// let delay = jittered(Duration::from_millis(1000), 25);
/// assert!(delay >= Duration::from_millis(1000));
/// assert!(delay <= Duration::from_millis(1250));
/// ```
pub fn jittered(delay: Duration, jitter_percent: u8) -> Duration {
    let base_ms = delay.as_millis() as u64;
    if jitter_percent == 0 || base_ms == 0 {
        return delay;
    }

    let max_jitter = base_ms.saturating_mul(u64::from(jitter_percent.min(100))) / 100;
    let jitter = rand::rng().random_range(0..=max_jitter);
    delay + Duration::from_millis(jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_inputs_return_delay_unchanged() {
        assert_eq!(jittered(Duration::ZERO, 50), Duration::ZERO);
        assert_eq!(jittered(Duration::from_secs(2), 0), Duration::from_secs(2));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        for _ in 0..100 {
            let delay = jittered(Duration::from_millis(400), 25);
            assert!(delay >= Duration::from_millis(400));
            assert!(delay <= Duration::from_millis(500));
        }
    }
}
