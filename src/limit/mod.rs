//! Shared token-bucket rate limiting
//!
//! One bucket governs the aggregate throughput of every session and both
//! directions. Capacity and fill rate are the same value, so at most one
//! second worth of traffic can burst.
//!
//! Callers reserve tokens up front and then sleep off any deficit. Each
//! reservation is taken under the bucket lock, so concurrent sessions are
//! served in lock order and the total can never outrun the fill rate.

use crate::config::ConfigError;
use crate::units::parse_size;
use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::trace;

/// Token bucket shared by every session
#[derive(Debug)]
pub struct RateLimiter {
    /// Fill rate in bytes per second, also the bucket capacity
    rate: u64,
    bucket: Mutex<Bucket>,
}

#[derive(Debug)]
struct Bucket {
    /// Available tokens, negative while callers are sleeping off a deficit
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    /// Create a limiter allowing `bytes_per_second`, starting with a full bucket
    pub fn new(bytes_per_second: u64) -> Result<Self, ConfigError> {
        if bytes_per_second == 0 {
            return Err(ConfigError::InvalidRate("0 is not a positive rate".to_string()));
        }
        Ok(Self {
            rate: bytes_per_second,
            bucket: Mutex::new(Bucket {
                tokens: bytes_per_second as f64,
                last_refill: Instant::now(),
            }),
        })
    }

    /// Parse a human-readable rate such as `1MB` (per second)
    pub fn from_rate_str(rate: &str) -> Result<Self, ConfigError> {
        let bytes = parse_size(rate).map_err(|_| ConfigError::InvalidRate(rate.to_string()))?;
        Self::new(bytes).map_err(|_| ConfigError::InvalidRate(format!("{} is not a positive rate", rate)))
    }

    /// Bytes per second
    pub fn rate(&self) -> u64 {
        self.rate
    }

    /// Largest single read that fits in the bucket
    pub fn max_chunk(&self) -> usize {
        usize::try_from(self.rate).unwrap_or(usize::MAX)
    }

    /// Wait until `n` bytes worth of tokens have been granted
    pub async fn acquire(&self, n: usize) {
        let mut remaining = n as u64;

        while remaining > 0 {
            let want = remaining.min(self.rate);
            remaining -= want;

            let wait = self.reserve(want);
            if !wait.is_zero() {
                trace!("Rate limiter waiting {:?} for {} bytes", wait, want);
                sleep(wait).await;
            }
        }
    }

    /// Take `n` tokens now and return how long the caller owes
    fn reserve(&self, n: u64) -> Duration {
        let rate = self.rate as f64;
        let mut bucket = self.bucket.lock();

        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * rate).min(rate);
        bucket.last_refill = now;

        bucket.tokens -= n as f64;
        if bucket.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-bucket.tokens / rate)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_zero_rate_is_rejected() {
        assert!(matches!(RateLimiter::new(0), Err(ConfigError::InvalidRate(_))));
        assert_eq!(RateLimiter::new(1).unwrap().rate(), 1);
    }

    #[test]
    fn test_from_rate_str() {
        assert_eq!(RateLimiter::from_rate_str("1MB").unwrap().rate(), 1 << 20);
        assert_eq!(RateLimiter::from_rate_str("512").unwrap().rate(), 512);
        assert!(matches!(
            RateLimiter::from_rate_str("0"),
            Err(ConfigError::InvalidRate(_))
        ));
        assert!(matches!(
            RateLimiter::from_rate_str("lots"),
            Err(ConfigError::InvalidRate(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_is_free() {
        let limiter = RateLimiter::new(1000).unwrap();
        let start = Instant::now();

        limiter.acquire(1000).await;

        assert!(start.elapsed() < Duration::from_millis(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sustained_throughput_is_bounded() {
        let limiter = RateLimiter::new(1000).unwrap();
        let start = Instant::now();

        // 1000 bytes of burst plus 2000 bytes at 1000 B/s
        for _ in 0..30 {
            limiter.acquire(100).await;
        }

        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(1900), "too fast: {:?}", elapsed);
        assert!(elapsed < Duration::from_secs(3), "too slow: {:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_acquire_is_split() {
        let limiter = RateLimiter::new(100).unwrap();
        let start = Instant::now();

        limiter.acquire(450).await;

        assert!(start.elapsed() >= Duration::from_millis(3400));
    }

    #[tokio::test(start_paused = true)]
    async fn test_limit_is_shared_across_tasks() {
        let limiter = Arc::new(RateLimiter::new(1000).unwrap());
        let start = Instant::now();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let limiter = Arc::clone(&limiter);
            handles.push(tokio::spawn(async move {
                for _ in 0..10 {
                    limiter.acquire(100).await;
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        // 4000 bytes total, 1000 of them burst
        assert!(start.elapsed() >= Duration::from_millis(2900));
    }
}
