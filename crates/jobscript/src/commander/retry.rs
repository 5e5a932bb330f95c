//! Retry backoff computation
//!
//! Delay curves: `none` retries immediately, `fixed` waits the configured
//! interval every attempt, `exponential` doubles from the interval and caps
//! at the maximum. Optional jitter spreads delays by up to half in either
//! direction so synchronized retries fan out.

use std::time::Duration;

use crate::model::{BackoffConfig, BackoffStrategy};

/// Interval used when the config leaves it unset.
pub const DEFAULT_BACKOFF_INTERVAL: Duration = Duration::from_millis(100);

/// Cap used when the config leaves it unset.
pub const DEFAULT_BACKOFF_MAX_INTERVAL: Duration = Duration::from_secs(5);

/// Delay to wait before the given attempt (1-based). Attempt 0 or a `none`
/// strategy yields no delay.
pub fn compute_backoff_delay(attempt: u32, cfg: &BackoffConfig) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }

    let interval = cfg.interval.filter(|d| !d.is_zero()).unwrap_or(DEFAULT_BACKOFF_INTERVAL);
    let max_interval = cfg
        .max_interval
        .filter(|d| !d.is_zero())
        .unwrap_or(DEFAULT_BACKOFF_MAX_INTERVAL);

    match cfg.strategy {
        BackoffStrategy::None => Duration::ZERO,
        BackoffStrategy::Fixed => apply_jitter(interval, cfg.jitter),
        BackoffStrategy::Exponential => {
            let mut delay = interval;
            for _ in 1..attempt {
                delay = delay.saturating_mul(2);
                if delay > max_interval {
                    // First over-cap iteration pins the delay and stops
                    // doubling.
                    delay = max_interval;
                    break;
                }
            }
            apply_jitter(delay, cfg.jitter)
        }
    }
}

/// Spread the delay by up to +/-50%, clamped at zero. Pseudo-randomness
/// comes from the system clock; retry spreading does not need more.
fn apply_jitter(delay: Duration, jitter: bool) -> Duration {
    if !jitter || delay.is_zero() {
        return delay;
    }

    let nanos = delay.as_nanos() as i128;
    let half = nanos / 2;
    if half == 0 {
        return delay;
    }

    let seed = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0) as i128;
    // Uniform-ish offset in [-half, +half].
    let offset = (seed % (half * 2 + 1)) - half;

    let jittered = nanos + offset;
    if jittered <= 0 {
        Duration::ZERO
    } else {
        Duration::from_nanos(jittered as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(strategy: BackoffStrategy, interval_ms: u64, max_ms: u64) -> BackoffConfig {
        BackoffConfig {
            strategy,
            interval: (interval_ms > 0).then(|| Duration::from_millis(interval_ms)),
            max_interval: (max_ms > 0).then(|| Duration::from_millis(max_ms)),
            jitter: false,
        }
    }

    #[test]
    fn none_strategy_never_waits() {
        let c = cfg(BackoffStrategy::None, 500, 5000);
        for attempt in 0..6 {
            assert_eq!(compute_backoff_delay(attempt, &c), Duration::ZERO);
        }
    }

    #[test]
    fn fixed_strategy_waits_the_interval_every_attempt() {
        let c = cfg(BackoffStrategy::Fixed, 250, 0);
        for attempt in 1..5 {
            assert_eq!(
                compute_backoff_delay(attempt, &c),
                Duration::from_millis(250)
            );
        }
    }

    #[test]
    fn exponential_doubles_then_caps() {
        let c = cfg(BackoffStrategy::Exponential, 100, 600);
        assert_eq!(compute_backoff_delay(1, &c), Duration::from_millis(100));
        assert_eq!(compute_backoff_delay(2, &c), Duration::from_millis(200));
        assert_eq!(compute_backoff_delay(3, &c), Duration::from_millis(400));
        // 800 would exceed the cap; pinned to it.
        assert_eq!(compute_backoff_delay(4, &c), Duration::from_millis(600));
        assert_eq!(compute_backoff_delay(10, &c), Duration::from_millis(600));
    }

    #[test]
    fn defaults_apply_when_config_is_zero() {
        let c = cfg(BackoffStrategy::Fixed, 0, 0);
        assert_eq!(compute_backoff_delay(1, &c), DEFAULT_BACKOFF_INTERVAL);

        let c = cfg(BackoffStrategy::Exponential, 0, 0);
        // Doubling from the default interval never exceeds the default cap
        // within a few attempts.
        assert_eq!(compute_backoff_delay(1, &c), DEFAULT_BACKOFF_INTERVAL);
        assert!(compute_backoff_delay(20, &c) <= DEFAULT_BACKOFF_MAX_INTERVAL);
    }

    #[test]
    fn exponential_never_exceeds_cap() {
        let c = cfg(BackoffStrategy::Exponential, 100, 450);
        for attempt in 1..32 {
            assert!(compute_backoff_delay(attempt, &c) <= Duration::from_millis(450));
        }
    }

    #[test]
    fn jitter_stays_within_half_band_and_non_negative() {
        let c = BackoffConfig {
            strategy: BackoffStrategy::Fixed,
            interval: Some(Duration::from_millis(200)),
            max_interval: None,
            jitter: true,
        };
        for _ in 0..64 {
            let delay = compute_backoff_delay(1, &c);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(300));
        }
    }

    #[test]
    fn attempt_zero_is_free() {
        let c = cfg(BackoffStrategy::Exponential, 100, 500);
        assert_eq!(compute_backoff_delay(0, &c), Duration::ZERO);
    }
}
