//! Per-sender token bucket.
//!
//! Tokens refill at `rate / per` per second up to a cap of `rate`. A sender's
//! very first request initialises a full bucket minus the token it spends.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use serde::Serialize;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize)]
pub struct RateLimiterStats {
    pub active_senders: usize,
    pub rate: u32,
    pub per: u32,
}

struct Bucket {
    tokens: f64,
    last_update: Instant,
}

pub struct RateLimiter {
    rate: u32,
    per: u32,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl RateLimiter {
    pub fn new(rate: u32, per: u32) -> Self {
        Self {
            rate,
            per,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Returns `(true, None)` when the request is allowed, or
    /// `(false, Some(message))` with a localized retry hint.
    pub fn check(&self, sender_id: &str) -> (bool, Option<String>) {
        use std::collections::hash_map::Entry;

        let now = Instant::now();
        let mut buckets = self.buckets.lock().unwrap();

        let bucket = match buckets.entry(sender_id.to_string()) {
            Entry::Vacant(slot) => {
                // First ever request: full bucket minus the token it spends.
                slot.insert(Bucket {
                    tokens: self.rate as f64 - 1.0,
                    last_update: now,
                });
                return (true, None);
            }
            Entry::Occupied(slot) => slot.into_mut(),
        };

        let elapsed = now.duration_since(bucket.last_update).as_secs_f64();
        let refill_per_sec = self.rate as f64 / self.per as f64;
        let tokens = (bucket.tokens + elapsed * refill_per_sec).min(self.rate as f64);

        if tokens >= 1.0 {
            bucket.tokens = tokens - 1.0;
            bucket.last_update = now;
            (true, None)
        } else {
            let wait_secs = ((1.0 - tokens) / refill_per_sec).ceil() as u64;
            warn!(sender = sender_id, wait_secs, "rate limit exceeded");
            (
                false,
                Some(format!("发送太频繁，请等待 {wait_secs} 秒后再试")),
            )
        }
    }

    pub fn reset(&self, sender_id: &str) {
        if self.buckets.lock().unwrap().remove(sender_id).is_some() {
            info!(sender = sender_id, "rate limit reset");
        }
    }

    pub fn stats(&self) -> RateLimiterStats {
        RateLimiterStats {
            active_senders: self.buckets.lock().unwrap().len(),
            rate: self.rate,
            per: self.per,
        }
    }
}
