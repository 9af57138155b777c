use rand::Rng;
use std::time::Duration;

/// Uniformly random duration in `[min, max]`, millisecond resolution.
pub(crate) fn sample_delay<R: Rng + ?Sized>(rng: &mut R, min: Duration, max: Duration) -> Duration {
    let lo = u64::try_from(min.as_millis()).unwrap_or(u64::MAX);
    let hi = u64::try_from(max.as_millis()).unwrap_or(u64::MAX).max(lo);
    Duration::from_millis(rng.random_range(lo..=hi))
}

/// `base * 2^(failures - 1)`, capped at `cap`.
pub(crate) fn config_backoff(base: Duration, cap: Duration, failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(20);
    base.saturating_mul(1u32 << exponent).min(cap)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn sampled_delays_stay_in_window() {
        let mut rng = StdRng::seed_from_u64(7);
        let min = Duration::from_millis(12_000);
        let max = Duration::from_millis(20_000);
        let mut seen_low = false;
        let mut seen_high = false;
        for _ in 0..10_000 {
            let delay = sample_delay(&mut rng, min, max);
            assert!(delay >= min && delay <= max, "{delay:?}");
            seen_low |= delay < Duration::from_millis(13_000);
            seen_high |= delay > Duration::from_millis(19_000);
        }
        assert!(seen_low && seen_high);
    }

    #[test]
    fn degenerate_window_returns_bound() {
        let mut rng = StdRng::seed_from_u64(1);
        let d = Duration::from_millis(500);
        assert_eq!(sample_delay(&mut rng, d, d), d);
        // Inverted windows collapse onto the minimum.
        assert_eq!(sample_delay(&mut rng, d, Duration::ZERO), d);
    }

    #[test]
    fn config_backoff_doubles_then_caps() {
        let base = Duration::from_secs(5);
        let cap = Duration::from_secs(60);
        let steps: Vec<u64> = (1..=6)
            .map(|n| config_backoff(base, cap, n).as_secs())
            .collect();
        assert_eq!(steps, [5, 10, 20, 40, 60, 60]);
        assert_eq!(config_backoff(base, cap, 0), base);
        assert_eq!(config_backoff(base, cap, u32::MAX), cap);
    }
}
