// Copyright 2023 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Token-bucket admission control keyed by request-name category, plus a
//! global bucket (spec §4.6).

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::warn;

use crate::config::BridgeConfig;

/// The outcome of an admission check, including the remaining-quota fields
/// surfaced to a denied caller.
#[derive(Debug, Clone, Copy)]
pub struct Admission {
    pub admitted: bool,
    pub category_remaining: u32,
    pub global_remaining: u32,
}

#[derive(Debug)]
struct Bucket {
    capacity: u32,
    refill_per_minute: u32,
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn new(capacity: u32, refill_per_minute: u32) -> Self {
        Self { capacity, refill_per_minute, tokens: capacity as f64, last_refill: Instant::now() }
    }

    fn refill(&mut self) {
        let elapsed = self.last_refill.elapsed().as_secs_f64();
        let refilled = elapsed * (self.refill_per_minute as f64 / 60.0);
        self.tokens = (self.tokens + refilled).min(self.capacity as f64);
        self.last_refill = Instant::now();
    }

    fn try_take(&mut self) -> bool {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn remaining(&self) -> u32 {
        self.tokens.floor().max(0.0) as u32
    }
}

/// A denial within the last `DENIAL_WINDOW` of the same category; five or
/// more within the window is logged as potential abuse (informational only).
const DENIAL_WINDOW: Duration = Duration::from_secs(300);
const ABUSE_THRESHOLD: usize = 5;

/// Per-category token buckets plus one global bucket.
pub struct RateLimiter {
    categories: DashMap<String, Bucket>,
    global: std::sync::Mutex<Bucket>,
    recent_denials: DashMap<String, Vec<Instant>>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter").field("categories", &self.categories.len()).finish()
    }
}

impl RateLimiter {
    pub fn new(config: &BridgeConfig) -> Self {
        let categories = DashMap::new();
        for (name, limit) in &config.rate_limits {
            categories.insert(name.clone(), Bucket::new(limit.capacity, limit.refill_per_minute));
        }
        // A global bucket sized generously over the sum of category capacities.
        let global_capacity: u32 = config.rate_limits.values().map(|l| l.capacity).sum();
        let global_refill: u32 = config.rate_limits.values().map(|l| l.refill_per_minute).sum();

        Self {
            categories,
            global: std::sync::Mutex::new(Bucket::new(
                global_capacity.max(1),
                global_refill.max(1),
            )),
            recent_denials: DashMap::new(),
        }
    }

    /// A request consumes one token from `category` and one from the global
    /// bucket; denial if either lacks a token.
    pub fn admit(&self, category: &str) -> Admission {
        let mut category_entry = self
            .categories
            .entry(category.to_string())
            .or_insert_with(|| Bucket::new(60, 60));

        let category_ok = category_entry.try_take();
        let mut global = self.global.lock().expect("rate limiter global mutex poisoned");
        let global_ok = global.try_take();

        let admitted = category_ok && global_ok;
        if !admitted {
            self.record_denial(category);
        }

        Admission {
            admitted,
            category_remaining: category_entry.remaining(),
            global_remaining: global.remaining(),
        }
    }

    fn record_denial(&self, category: &str) {
        let now = Instant::now();
        let mut entry = self.recent_denials.entry(category.to_string()).or_default();
        entry.retain(|t| now.duration_since(*t) <= DENIAL_WINDOW);
        entry.push(now);
        if entry.len() >= ABUSE_THRESHOLD {
            warn!(category, count = entry.len(), "potential abuse: repeated rate-limit denials");
        }
    }

    /// Snapshot of remaining tokens per category, for the monitoring
    /// `status` command.
    pub fn snapshot(&self) -> BTreeMap<String, u32> {
        self.categories.iter().map(|e| (e.key().clone(), e.value().remaining())).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_heavy_capacity(capacity: u32) -> BridgeConfig {
        let mut config = BridgeConfig::default();
        config.rate_limits.insert(
            "heavy".to_string(),
            crate::config::RateLimitConfig { capacity, refill_per_minute: 0 },
        );
        config
    }

    #[test]
    fn sixth_request_is_denied_at_capacity_five() {
        let config = config_with_heavy_capacity(5);
        let limiter = RateLimiter::new(&config);

        for _ in 0..5 {
            assert!(limiter.admit("heavy").admitted);
        }
        let sixth = limiter.admit("heavy");
        assert!(!sixth.admitted);
    }

    #[test]
    fn categories_are_independent() {
        let config = config_with_heavy_capacity(1);
        let limiter = RateLimiter::new(&config);

        assert!(limiter.admit("heavy").admitted);
        assert!(!limiter.admit("heavy").admitted);
        // lightweight has its own bucket from defaults and should still admit.
        assert!(limiter.admit("lightweight").admitted);
    }

    #[test]
    fn repeated_denials_are_tracked_for_abuse_signal() {
        let config = config_with_heavy_capacity(0);
        let limiter = RateLimiter::new(&config);
        for _ in 0..ABUSE_THRESHOLD {
            limiter.admit("heavy");
        }
        let denials = limiter.recent_denials.get("heavy").unwrap();
        assert!(denials.len() >= ABUSE_THRESHOLD);
    }
}
