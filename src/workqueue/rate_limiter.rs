// Copyright 2025 The Kubernetes Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Rate limiters deciding how long a failing item waits before it is requeued.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Default initial delay of the per-item exponential limiter.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(5);

/// Default upper bound of the per-item exponential limiter.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1000);

/// Decides the requeue delay for an item.
pub trait RateLimiter<T>: Send + Sync {
    /// Returns how long to wait before the item is requeued, and records
    /// the attempt.
    fn when(&self, item: &T) -> Duration;

    /// Stops tracking the item. Its next failure starts from the base delay.
    fn forget(&self, item: &T);

    /// Returns how many times the item has been requeued through `when`.
    fn num_requeues(&self, item: &T) -> u32;
}

/// Per-item exponential backoff: `base * 2^failures`, capped at `max`.
#[derive(Debug)]
pub struct ItemExponentialFailureRateLimiter<T> {
    failures: Mutex<HashMap<T, u32>>,
    base_delay: Duration,
    max_delay: Duration,
}

impl<T> ItemExponentialFailureRateLimiter<T> {
    /// Creates a limiter with the given base and maximum delay.
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            failures: Mutex::new(HashMap::new()),
            base_delay,
            max_delay,
        }
    }

    fn failures(&self) -> MutexGuard<'_, HashMap<T, u32>> {
        self.failures.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> Default for ItemExponentialFailureRateLimiter<T> {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY)
    }
}

impl<T> RateLimiter<T> for ItemExponentialFailureRateLimiter<T>
where
    T: Clone + Eq + Hash + Send,
{
    fn when(&self, item: &T) -> Duration {
        let mut failures = self.failures();
        let count = failures.entry(item.clone()).or_insert(0);
        let exp = *count;
        *count = count.saturating_add(1);

        // Computed in floating point so large exponents saturate instead of overflowing.
        let backoff = self.base_delay.as_secs_f64() * 2f64.powi(exp.min(i32::MAX as u32) as i32);
        if !backoff.is_finite() || backoff > self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(backoff)
    }

    fn forget(&self, item: &T) {
        self.failures().remove(item);
    }

    fn num_requeues(&self, item: &T) -> u32 {
        self.failures().get(item).copied().unwrap_or(0)
    }
}

/// The limiter used by controllers unless configured otherwise.
pub fn default_controller_rate_limiter<T>() -> ItemExponentialFailureRateLimiter<T> {
    ItemExponentialFailureRateLimiter::default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_backoff_doubles() {
        let limiter = ItemExponentialFailureRateLimiter::new(
            Duration::from_millis(1),
            Duration::from_secs(1),
        );

        assert_eq!(limiter.when(&"one"), Duration::from_millis(1));
        assert_eq!(limiter.when(&"one"), Duration::from_millis(2));
        assert_eq!(limiter.when(&"one"), Duration::from_millis(4));
        assert_eq!(limiter.num_requeues(&"one"), 3);

        // Independent per item
        assert_eq!(limiter.when(&"two"), Duration::from_millis(1));
        assert_eq!(limiter.num_requeues(&"two"), 1);
    }

    #[test]
    fn test_exponential_backoff_is_capped() {
        let limiter = ItemExponentialFailureRateLimiter::new(
            Duration::from_millis(1),
            Duration::from_millis(10),
        );

        for _ in 0..10 {
            limiter.when(&"key");
        }
        assert_eq!(limiter.when(&"key"), Duration::from_millis(10));

        // Many more failures must not overflow
        for _ in 0..2000 {
            assert!(limiter.when(&"key") <= Duration::from_millis(10));
        }
    }

    #[test]
    fn test_forget_resets_backoff() {
        let limiter = ItemExponentialFailureRateLimiter::<&str>::default();

        limiter.when(&"key");
        limiter.when(&"key");
        assert_eq!(limiter.num_requeues(&"key"), 2);

        limiter.forget(&"key");
        assert_eq!(limiter.num_requeues(&"key"), 0);
        assert_eq!(limiter.when(&"key"), DEFAULT_BASE_DELAY);
    }
}
