//! Token bucket rate limiter.

use std::time::Instant;

use parking_lot::Mutex;

/// Token bucket parameters: `limit` tokens refilled per second, up to `burst`
/// tokens held at rest.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rate {
    /// Tokens refilled per second.
    pub limit: f64,
    /// Maximum bucket size.
    pub burst: u64,
}

impl Rate {
    /// Creates a rate of `limit` tokens/sec with the given burst.
    #[must_use]
    pub fn new(limit: f64, burst: u64) -> Self {
        Self { limit, burst }
    }
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// A token bucket limiter.
///
/// The bucket starts full. [`try_acquire`](TokenBucketLimiter::try_acquire)
/// never blocks: it refills by elapsed time, then either takes a token or
/// reports denial. Over any interval `t` the bucket admits at most
/// `burst + limit * t` acquisitions.
pub struct TokenBucketLimiter {
    rate: Rate,
    bucket: Mutex<Bucket>,
}

impl TokenBucketLimiter {
    /// Creates a limiter with a full bucket.
    #[must_use]
    pub fn new(rate: Rate) -> Self {
        Self {
            rate,
            bucket: Mutex::new(Bucket {
                tokens: rate.burst as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Returns the configured rate.
    #[must_use]
    pub fn rate(&self) -> Rate {
        self.rate
    }

    /// Attempts to take one token. Returns false when the bucket is empty.
    pub fn try_acquire(&self) -> bool {
        let mut bucket = self.bucket.lock();

        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            bucket.tokens = (bucket.tokens + elapsed * self.rate.limit).min(self.rate.burst as f64);
            bucket.last_refill = now;
        }

        if bucket.tokens < 1.0 {
            return false;
        }
        bucket.tokens -= 1.0;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn burst_admits_then_denies() {
        let limiter = TokenBucketLimiter::new(Rate::new(5.0, 10));
        let admitted = (0..15).filter(|_| limiter.try_acquire()).count();
        assert_eq!(admitted, 10);
    }

    #[test]
    fn refills_over_time() {
        let limiter = TokenBucketLimiter::new(Rate::new(100.0, 1));
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
        std::thread::sleep(Duration::from_millis(20));
        assert!(limiter.try_acquire());
    }

    #[test]
    fn bucket_never_exceeds_burst() {
        let limiter = TokenBucketLimiter::new(Rate::new(1000.0, 2));
        std::thread::sleep(Duration::from_millis(20));
        let admitted = (0..10).filter(|_| limiter.try_acquire()).count();
        assert_eq!(admitted, 2);
    }
}
