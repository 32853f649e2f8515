//! Retry backoff policy.

use std::time::Duration;

/// Exponential backoff: `base^attempts` seconds.
///
/// No jitter and no cap; the base is the only tunable (config key
/// `backoff_base`). Negative attempt counts are treated as zero.
pub fn backoff_delay(attempts: i32, base: u32) -> Duration {
    let exp = attempts.max(0) as u32;
    let secs = (base.max(1) as u64).saturating_pow(exp);
    Duration::from_secs(secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_attempt_waits_one_second() {
        assert_eq!(backoff_delay(0, 2), Duration::from_secs(1));
    }

    #[test]
    fn delay_doubles_per_attempt_at_base_2() {
        assert_eq!(backoff_delay(1, 2), Duration::from_secs(2));
        assert_eq!(backoff_delay(2, 2), Duration::from_secs(4));
        assert_eq!(backoff_delay(3, 2), Duration::from_secs(8));
    }

    #[test]
    fn base_three_grows_faster() {
        assert_eq!(backoff_delay(2, 3), Duration::from_secs(9));
    }

    #[test]
    fn degenerate_inputs_are_clamped() {
        assert_eq!(backoff_delay(-1, 2), Duration::from_secs(1));
        assert_eq!(backoff_delay(5, 0), Duration::from_secs(1));
    }
}
