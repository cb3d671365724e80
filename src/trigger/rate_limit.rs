/// Per-path token buckets
///
/// One bucket per webhook path, created full on first request. Refill is
/// `capacity / 60` tokens per second from a monotonic clock, capped at capacity.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl Bucket {
    fn new(per_minute: u32, now: Instant) -> Self {
        let capacity = f64::from(per_minute.max(1));
        Self {
            tokens: capacity,
            capacity,
            refill_per_sec: capacity / 60.0,
            last_refill: now,
        }
    }

    fn try_take(&mut self, now: Instant) -> bool {
        // saturating: a clock that appears to go backwards refills nothing
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[derive(Debug, Clone)]
pub struct RateLimiter {
    buckets: Arc<Mutex<HashMap<String, Bucket>>>,
    default_per_minute: u32,
}

impl RateLimiter {
    pub fn new(default_per_minute: u32) -> Self {
        Self {
            buckets: Arc::new(Mutex::new(HashMap::new())),
            default_per_minute: default_per_minute.max(1),
        }
    }

    /// Take one token for `path`. Returns whether the request is admitted.
    pub fn check(&self, path: &str, per_minute: Option<u32>) -> bool {
        self.check_at(path, per_minute, Instant::now())
    }

    pub fn check_at(&self, path: &str, per_minute: Option<u32>, now: Instant) -> bool {
        let capacity = per_minute.unwrap_or(self.default_per_minute);
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        let bucket = buckets
            .entry(path.to_string())
            .or_insert_with(|| Bucket::new(capacity, now));
        if bucket.capacity != f64::from(capacity.max(1)) {
            // route re-armed with a different limit
            *bucket = Bucket::new(capacity, now);
        }
        bucket.try_take(now)
    }

    /// Forget a path's bucket (on disarm)
    pub fn remove(&self, path: &str) {
        self.buckets.lock().unwrap_or_else(|e| e.into_inner()).remove(path);
    }
}
