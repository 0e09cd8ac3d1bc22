//! Retry backoff.
//!
//! Stateless: the engine tracks attempts and asks for the next delay.

use std::time::Duration;

use petal_types::step::RetryPolicy;
use rand::Rng;

/// Delay bounds used when a step's policy leaves them unset.
#[derive(Debug, Clone, Copy)]
pub struct BackoffDefaults {
    pub base: Duration,
    pub max: Duration,
}

/// Whether another attempt is allowed after `failures` failed attempts.
/// `max` counts retries, so a step runs at most `max + 1` times.
pub fn should_retry(policy: &RetryPolicy, failures: u32) -> bool {
    failures <= policy.max
}

/// Delay before the next attempt after `failures` (1-based) failures,
/// without jitter: `min(delay * backoff^(failures - 1), max_delay)`.
pub fn base_delay(policy: &RetryPolicy, failures: u32, defaults: BackoffDefaults) -> Duration {
    let delay = policy.delay.map(|d| d.as_duration()).unwrap_or(defaults.base);
    let cap = policy.max_delay.map(|d| d.as_duration()).unwrap_or(defaults.max);
    let exponent = failures.saturating_sub(1).min(63) as i32;
    let scaled = delay.as_secs_f64() * policy.backoff.powi(exponent);
    if !scaled.is_finite() || scaled >= cap.as_secs_f64() {
        cap
    } else {
        Duration::from_secs_f64(scaled)
    }
}

/// [`base_delay`] plus up to 50% random jitter when the policy enables it.
pub fn next_delay(policy: &RetryPolicy, failures: u32, defaults: BackoffDefaults) -> Duration {
    let delay = base_delay(policy, failures, defaults);
    if !policy.jitter || delay.is_zero() {
        return delay;
    }
    let extra = rand::thread_rng().gen_range(0.0..=0.5);
    delay + delay.mul_f64(extra)
}

#[cfg(test)]
mod tests {
    use super::*;
    use petal_types::duration::PetalDuration;

    const DEFAULTS: BackoffDefaults = BackoffDefaults {
        base: Duration::from_millis(200),
        max: Duration::from_secs(30),
    };

    fn policy(max: u32) -> RetryPolicy {
        RetryPolicy {
            max,
            backoff: 2.0,
            delay: Some(PetalDuration::from_millis(100)),
            max_delay: Some(PetalDuration::from_millis(500)),
            jitter: false,
        }
    }

    #[test]
    fn test_max_counts_retries() {
        let p = policy(2);
        assert!(should_retry(&p, 1));
        assert!(should_retry(&p, 2));
        assert!(!should_retry(&p, 3));
        assert!(!should_retry(&policy(0), 1));
    }

    #[test]
    fn test_exponential_with_cap() {
        let p = policy(5);
        assert_eq!(base_delay(&p, 1, DEFAULTS), Duration::from_millis(100));
        assert_eq!(base_delay(&p, 2, DEFAULTS), Duration::from_millis(200));
        assert_eq!(base_delay(&p, 3, DEFAULTS), Duration::from_millis(400));
        assert_eq!(base_delay(&p, 4, DEFAULTS), Duration::from_millis(500));
        assert_eq!(base_delay(&p, 60, DEFAULTS), Duration::from_millis(500));
    }

    #[test]
    fn test_defaults_fill_unset_bounds() {
        let p = RetryPolicy {
            delay: None,
            max_delay: None,
            ..policy(1)
        };
        assert_eq!(base_delay(&p, 1, DEFAULTS), Duration::from_millis(200));
        assert_eq!(base_delay(&p, 20, DEFAULTS), Duration::from_secs(30));
    }

    #[test]
    fn test_jitter_stays_within_half() {
        let p = RetryPolicy {
            jitter: true,
            ..policy(3)
        };
        for _ in 0..50 {
            let d = next_delay(&p, 2, DEFAULTS);
            assert!(d >= Duration::from_millis(200) && d <= Duration::from_millis(300), "{d:?}");
        }
    }
}
