//! Delay helpers for periodic work against a remote backend.

use rand::Rng;
use std::time::Duration;

/// Return a duration of `value_secs * [1-factor; 1+factor[` seconds, capped
/// at `max_secs` before scaling. `factor` must be below 1.
pub fn jitter_delay(value_secs: f64, factor: f64, max_secs: f64) -> Duration {
    let value = value_secs.min(max_secs);
    let scale = 1.0 - factor + rand::thread_rng().gen::<f64>() * 2.0 * factor;
    Duration::from_secs_f64((value * scale).max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_stays_in_range() {
        for _ in 0..100 {
            let d = jitter_delay(100.0, 0.1, 900.0).as_secs_f64();
            assert!((90.0..110.0).contains(&d), "delay {d} out of range");
        }
    }

    #[test]
    fn jitter_respects_max() {
        for _ in 0..100 {
            let d = jitter_delay(5000.0, 0.1, 900.0).as_secs_f64();
            assert!(d <= 990.0, "delay {d} exceeds jittered max");
        }
    }
}
