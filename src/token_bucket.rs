/// A token bucket measured in milliseconds.
///
/// Starts full. Tokens accrue continuously at `rate_per_sec` up to `burst`.
#[derive(Clone, Debug)]
pub(crate) struct TokenBucket {
    burst: f64,
    tokens: f64,
    rate_per_ms: f64,
    last_refill: Option<u64>,
}

impl TokenBucket {
    pub(crate) fn new(rate_per_sec: f64, burst: u32) -> Self {
        Self {
            burst: burst as f64,
            tokens: burst as f64,
            rate_per_ms: rate_per_sec / 1000.0,
            last_refill: None,
        }
    }

    fn refill(&mut self, now: u64) {
        if let Some(last) = self.last_refill {
            if now <= last {
                return;
            }
            let elapsed = (now - last) as f64;
            self.tokens = (self.tokens + elapsed * self.rate_per_ms).min(self.burst);
        }
        self.last_refill = Some(now);
    }

    /// Takes one token if available.
    pub(crate) fn try_acquire(&mut self, now: u64) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_burst_then_refill() {
        let mut bucket = TokenBucket::new(10.0, 10);
        for _ in 0..10 {
            assert!(bucket.try_acquire(0));
        }
        assert!(!bucket.try_acquire(0));
        assert!(!bucket.try_acquire(50));
        assert!(bucket.try_acquire(100));
        assert!(!bucket.try_acquire(100));
    }

    #[test]
    fn test_refill_is_capped() {
        let mut bucket = TokenBucket::new(10.0, 10);
        assert!(bucket.try_acquire(0));
        let granted = (0..20).filter(|_| bucket.try_acquire(60_000)).count();
        assert_eq!(granted, 10);
    }

    #[test]
    fn test_clock_going_backwards_is_ignored() {
        let mut bucket = TokenBucket::new(10.0, 1);
        assert!(bucket.try_acquire(1000));
        assert!(!bucket.try_acquire(500));
        assert!(bucket.try_acquire(1100));
    }
}
