//! Token-bucket rate limiter keyed on client IP.
//!
//! Shared-resource discipline per the concurrency model: a single mutex
//! guards the bucket map, plus a background task that evicts buckets idle
//! for more than 5 minutes so long-lived processes don't accumulate one
//! entry per client forever.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const IDLE_EVICTION: Duration = Duration::from_secs(5 * 60);

struct Bucket {
    tokens: f64,
    last_refill: Instant,
    last_used: Instant,
}

pub struct RateLimiter {
    capacity: f64,
    refill_per_sec: f64,
    buckets: Mutex<HashMap<IpAddr, Bucket>>,
}

impl RateLimiter {
    pub fn new(capacity: f64, refill_per_sec: f64) -> Self {
        Self { capacity, refill_per_sec, buckets: Mutex::new(HashMap::new()) }
    }

    /// Attempt to consume one token for `ip`. Returns `true` if allowed.
    pub fn check(&self, ip: IpAddr) -> bool {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().expect("rate limiter mutex poisoned");
        let bucket = buckets.entry(ip).or_insert_with(|| Bucket { tokens: self.capacity, last_refill: now, last_used: now });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        bucket.last_refill = now;
        bucket.last_used = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Drop buckets that haven't been touched in [`IDLE_EVICTION`]. Intended
    /// to be called periodically from a background task.
    pub fn evict_idle(&self) {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().expect("rate limiter mutex poisoned");
        buckets.retain(|_, bucket| now.duration_since(bucket.last_used) < IDLE_EVICTION);
    }

    #[cfg(test)]
    fn bucket_count(&self) -> usize {
        self.buckets.lock().unwrap().len()
    }
}

/// Spawn the periodic eviction task. The returned handle should be aborted
/// on engine shutdown.
pub fn spawn_eviction_task(limiter: std::sync::Arc<RateLimiter>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            limiter.evict_idle();
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn ip() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
    }

    #[test]
    fn allows_up_to_capacity_then_rejects() {
        let limiter = RateLimiter::new(3.0, 0.0);
        assert!(limiter.check(ip()));
        assert!(limiter.check(ip()));
        assert!(limiter.check(ip()));
        assert!(!limiter.check(ip()), "fourth request should be rejected with no refill");
    }

    #[test]
    fn different_ips_have_independent_buckets() {
        let limiter = RateLimiter::new(1.0, 0.0);
        assert!(limiter.check(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))));
        assert!(limiter.check(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2))));
    }

    #[test]
    fn eviction_removes_idle_buckets() {
        let limiter = RateLimiter::new(1.0, 1.0);
        limiter.check(ip());
        assert_eq!(limiter.bucket_count(), 1);
        // Can't fast-forward Instant in a unit test without a fake clock;
        // just assert eviction doesn't remove a bucket touched moments ago.
        limiter.evict_idle();
        assert_eq!(limiter.bucket_count(), 1);
    }
}
