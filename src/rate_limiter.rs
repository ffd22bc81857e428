//! Per-pool token bucket rate limiter (spec §4.4). A worker calls
//! [`RateLimiter::acquire`] before issuing an exchange call; the wait is a
//! single suspension point and releases no tokens on cancellation (none
//! are held while waiting, per spec §5 "Suspension points").

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

struct Bucket {
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl Bucket {
    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }
}

pub struct RateLimiter {
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    pub fn new(budget_per_sec: u32) -> Self {
        let budget = budget_per_sec.max(1) as f64;
        Self {
            bucket: Mutex::new(Bucket {
                tokens: budget,
                capacity: budget,
                refill_per_sec: budget,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Halve the refill rate for the next `duration` — the conservative
    /// backoff spec §7 prescribes on an exchange rate-limit refusal. Takes
    /// `self` by `Arc` so the restore can be a detached task outliving the
    /// caller's stack frame.
    pub fn throttle(self: &Arc<Self>, duration: Duration) {
        let original = {
            let mut bucket = self.bucket.lock().unwrap();
            let original = bucket.refill_per_sec;
            bucket.refill_per_sec /= 2.0;
            original
        };
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            limiter.bucket.lock().unwrap().refill_per_sec = original;
        });
    }

    /// Block (cooperatively) until a token is available, then consume one.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut bucket = self.bucket.lock().unwrap();
                bucket.refill(Instant::now());
                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    None
                } else {
                    let deficit = 1.0 - bucket.tokens;
                    let rate = bucket.refill_per_sec.max(0.001);
                    Some(Duration::from_secs_f64(deficit / rate))
                }
            };
            match wait {
                None => return,
                Some(d) => tokio::time::sleep(d).await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquires_immediately_within_capacity() {
        let limiter = RateLimiter::new(5);
        for _ in 0..5 {
            tokio::time::timeout(Duration::from_millis(50), limiter.acquire())
                .await
                .expect("should not need to wait within budget");
        }
    }

    #[tokio::test]
    async fn blocks_once_capacity_exhausted() {
        let limiter = RateLimiter::new(2);
        limiter.acquire().await;
        limiter.acquire().await;
        let result = tokio::time::timeout(Duration::from_millis(20), limiter.acquire()).await;
        assert!(result.is_err(), "third acquire should have to wait for refill");
    }
}
