use std::time::Duration;

/// Exponential reconnect backoff with a ceiling.
///
/// The n-th consecutive failure waits `min(base * 2^n, max)`. The attempt
/// counter stops growing once the ceiling is reached, and [`Backoff::reset`]
/// returns to `base` once a connection has carried a payload.
#[derive(Clone, Debug)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

const MAX_EXPONENT: u32 = 31;

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            attempt: 0,
        }
    }

    /// Delay for the current failure; advances the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.base.saturating_mul(1u32 << self.attempt).min(self.max);
        if delay < self.max && self.attempt < MAX_EXPONENT {
            self.attempt += 1;
        }
        delay
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_up_to_ceiling() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(8));
        let delays: Vec<u64> = (0..6).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 8, 8]);
        assert_eq!(backoff.attempt(), 3);
    }

    #[test]
    fn reset_returns_to_base() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(1));
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn delays_never_decrease() {
        let mut backoff = Backoff::new(Duration::from_millis(3), Duration::from_millis(1000));
        let mut last = Duration::ZERO;
        for _ in 0..64 {
            let delay = backoff.next_delay();
            assert!(delay >= last);
            assert!(delay <= Duration::from_millis(1000));
            last = delay;
        }
    }
}
