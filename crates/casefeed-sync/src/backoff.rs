use crate::config::BackoffConfig;
use rand::Rng;
use std::time::Duration;

/// Exponential reconnect delay with bounded jitter.
///
/// Attempt `n` has nominal delay `base * 2^n`. Jitter adds at most
/// `jitter * nominal` with `jitter <= 1`, which keeps successive delays
/// non-decreasing since the next nominal is already twice the current one.
/// Every delay is clamped to `cap`.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn next_delay(&mut self) -> Duration {
        self.next_delay_with(&mut rand::thread_rng())
    }

    pub fn next_delay_with<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Duration {
        let nominal = self.nominal(self.attempt);
        self.attempt = self.attempt.saturating_add(1);

        let jitter = self.config.jitter.clamp(0.0, 1.0);
        let delay = if jitter > 0.0 && nominal < self.config.cap {
            nominal.mul_f64(1.0 + rng.gen_range(0.0..=jitter))
        } else {
            nominal
        };
        delay.min(self.config.cap)
    }

    fn nominal(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(31));
        self.config
            .base
            .checked_mul(factor)
            .unwrap_or(self.config.cap)
            .min(self.config.cap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn config(jitter: f64) -> BackoffConfig {
        BackoffConfig {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
            jitter,
        }
    }

    #[test]
    fn delays_double_up_to_the_cap_without_jitter() {
        let mut backoff = Backoff::new(config(0.0));
        let delays: Vec<u64> = (0..7).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
    }

    #[test]
    fn jittered_delays_are_non_decreasing_and_capped() {
        for seed in 0..50u64 {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut backoff = Backoff::new(config(1.0));
            let mut previous = Duration::ZERO;
            for _ in 0..12 {
                let delay = backoff.next_delay_with(&mut rng);
                assert!(delay >= previous, "seed {seed}: {delay:?} < {previous:?}");
                assert!(delay <= Duration::from_secs(30));
                previous = delay;
            }
        }
    }

    #[test]
    fn three_failures_then_success_restarts_at_base() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut backoff = Backoff::new(config(0.2));
        let first = backoff.next_delay_with(&mut rng);
        let second = backoff.next_delay_with(&mut rng);
        let third = backoff.next_delay_with(&mut rng);
        assert!(first <= second && second <= third);
        assert!(third <= Duration::from_secs(30));
        assert_eq!(backoff.attempt(), 3);

        backoff.reset();
        let after_success = backoff.next_delay_with(&mut rng);
        assert!(after_success >= Duration::from_secs(1));
        assert!(after_success <= Duration::from_millis(1_200));
    }

    #[test]
    fn huge_attempt_counts_do_not_overflow() {
        let mut backoff = Backoff::new(config(0.0));
        for _ in 0..200 {
            backoff.next_delay();
        }
        assert_eq!(backoff.next_delay(), Duration::from_secs(30));
    }
}
