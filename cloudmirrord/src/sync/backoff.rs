use rand::Rng;
use std::time::Duration;

/// Exponential retry delay for transient failures, capped at `max`.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter: bool,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, jitter: bool) -> Self {
        Self { base, max, jitter }
    }

    /// Delay before the retry that follows failed attempt number `attempt`
    /// (zero-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let mut rng = rand::thread_rng();
        self.delay_with_rng(attempt, &mut rng)
    }

    pub fn delay_with_rng<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base_ms = self.base.as_millis().min(u128::from(u64::MAX)) as u64;
        let max_ms = self.max.as_millis().min(u128::from(u64::MAX)) as u64;
        let exp = base_ms.saturating_mul(1u64 << attempt.min(16)).min(max_ms);
        if !self.jitter || exp == 0 {
            return Duration::from_millis(exp);
        }
        // jitter within the upper half of the window
        let floor = exp / 2;
        Duration::from_millis(rng.gen_range(floor..=exp))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn backoff_without_jitter_is_exponential() {
        let backoff = Backoff::new(
            Duration::from_millis(100),
            Duration::from_millis(800),
            false,
        );
        let mut rng = StdRng::seed_from_u64(1);
        let delays: Vec<u64> = (0..5)
            .map(|attempt| backoff.delay_with_rng(attempt, &mut rng).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 800]);
    }

    #[test]
    fn backoff_with_jitter_stays_in_upper_half() {
        let backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(800), true);
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..32 {
            let delay = backoff.delay_with_rng(3, &mut rng);
            assert!(delay <= Duration::from_millis(800));
            assert!(delay >= Duration::from_millis(400));
        }
    }

    #[test]
    fn zero_base_never_sleeps() {
        let backoff = Backoff::new(Duration::ZERO, Duration::from_secs(1), true);
        assert_eq!(backoff.delay(7), Duration::ZERO);
    }
}
