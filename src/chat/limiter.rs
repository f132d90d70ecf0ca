//! Per-tenant token-bucket throttle for outbound sends.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use uuid::Uuid;

/// Token bucket state for one tenant.
#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Per-tenant token bucket. Capacity and refill rate derive from the
/// configured sends-per-minute; a full bucket absorbs bursts up to the
/// per-minute allowance.
#[derive(Debug)]
pub struct RateLimiter {
    capacity: f64,
    refill_per_sec: f64,
    buckets: Mutex<HashMap<Uuid, Bucket>>,
}

impl RateLimiter {
    /// Create a limiter allowing `per_minute` sends per tenant.
    pub fn new(per_minute: u32) -> Self {
        let capacity = f64::from(per_minute.max(1));
        Self {
            capacity,
            refill_per_sec: capacity / 60.0,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Try to take one token. Returns the wait duration when empty.
    pub fn try_acquire(&self, tenant_id: Uuid) -> Result<(), Duration> {
        self.try_acquire_at(tenant_id, Instant::now())
    }

    fn try_acquire_at(&self, tenant_id: Uuid, now: Instant) -> Result<(), Duration> {
        let mut buckets = match self.buckets.lock() {
            Ok(guard) => guard,
            // A poisoned lock fails open: throttling is a courtesy to the
            // chat service, not a correctness invariant.
            Err(_) => return Ok(()),
        };
        let bucket = buckets.entry(tenant_id).or_insert(Bucket {
            tokens: self.capacity,
            last_refill: now,
        });

        let elapsed = now.saturating_duration_since(bucket.last_refill);
        bucket.tokens =
            (bucket.tokens + elapsed.as_secs_f64() * self.refill_per_sec).min(self.capacity);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(())
        } else {
            let deficit = 1.0 - bucket.tokens;
            Err(Duration::from_secs_f64(deficit / self.refill_per_sec))
        }
    }
}
