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

//! Rate-limited work queue.
//!
//! The queue guarantees that:
//! - an item is queued at most once while it waits to be processed,
//! - an item is never handed to two workers at the same time,
//! - an item added while it is being processed is queued again once the
//!   worker calls [`WorkQueue::done`].
//!
//! Failing items are requeued through [`WorkQueue::add_rate_limited`], whose
//! delay grows with each failure until [`WorkQueue::forget`] is called.

mod rate_limiter;

pub use rate_limiter::{
    default_controller_rate_limiter, ItemExponentialFailureRateLimiter, RateLimiter,
    DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY,
};

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;

/// A deduplicating, rate-limited FIFO queue shared between producers and workers.
///
/// Cloning is cheap and yields a handle to the same queue.
pub struct WorkQueue<T> {
    inner: Arc<Inner<T>>,
}

struct Inner<T> {
    name: String,
    state: Mutex<State<T>>,
    notify: Notify,
    rate_limiter: Box<dyn RateLimiter<T>>,
}

struct State<T> {
    /// Items in processing order.
    queue: VecDeque<T>,
    /// Items that need processing. Each is either in `queue` or in `processing`.
    dirty: HashSet<T>,
    /// Items currently held by a worker.
    processing: HashSet<T>,
    shutting_down: bool,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> fmt::Debug for WorkQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state();
        f.debug_struct("WorkQueue")
            .field("name", &self.inner.name)
            .field("queued", &state.queue.len())
            .field("processing", &state.processing.len())
            .field("shutting_down", &state.shutting_down)
            .finish()
    }
}

impl<T> Inner<T> {
    fn state(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> WorkQueue<T>
where
    T: Clone + Eq + Hash + Send + Sync + 'static,
{
    /// Creates a queue using the default controller rate limiter.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_rate_limiter(name, default_controller_rate_limiter())
    }

    /// Creates a queue with a custom rate limiter.
    pub fn with_rate_limiter(
        name: impl Into<String>,
        rate_limiter: impl RateLimiter<T> + 'static,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    shutting_down: false,
                }),
                notify: Notify::new(),
                rate_limiter: Box::new(rate_limiter),
            }),
        }
    }

    /// Returns the name of this queue.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Marks the item as needing processing.
    ///
    /// Does nothing if the item is already waiting. If the item is being
    /// processed, it is queued again when the worker calls [`done`](Self::done).
    pub fn add(&self, item: T) {
        let mut state = self.inner.state();
        if state.shutting_down || state.dirty.contains(&item) {
            return;
        }
        state.dirty.insert(item.clone());
        if state.processing.contains(&item) {
            return;
        }
        state.queue.push_back(item);
        drop(state);
        self.inner.notify.notify_one();
    }

    /// Adds the item once `delay` has elapsed.
    ///
    /// Must be called from within a tokio runtime when `delay` is non-zero.
    pub fn add_after(&self, item: T, delay: Duration) {
        if self.is_shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.add(item);
            return;
        }

        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(item);
        });
    }

    /// Adds the item after the rate limiter says it is ok.
    pub fn add_rate_limited(&self, item: T) {
        let delay = self.inner.rate_limiter.when(&item);
        self.add_after(item, delay);
    }

    /// Clears the rate limiter's failure history for the item.
    pub fn forget(&self, item: &T) {
        self.inner.rate_limiter.forget(item);
    }

    /// Returns how many times the item has been requeued after failures.
    pub fn num_requeues(&self, item: &T) -> u32 {
        self.inner.rate_limiter.num_requeues(item)
    }

    /// Waits for the next item and marks it as being processed.
    ///
    /// Returns `None` once the queue is shut down and every waiting item has
    /// been handed out. Each returned item must be passed to
    /// [`done`](Self::done) exactly once.
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // Register before inspecting the state so a concurrent add or
            // shutdown cannot be missed.
            notified.as_mut().enable();

            {
                let mut state = self.inner.state();
                if let Some(item) = state.queue.pop_front() {
                    state.dirty.remove(&item);
                    state.processing.insert(item.clone());
                    let more = !state.queue.is_empty();
                    drop(state);
                    if more {
                        // Pass a consumed wakeup on to another waiter.
                        self.inner.notify.notify_one();
                    }
                    return Some(item);
                }
                if state.shutting_down {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Marks the item as done processing.
    ///
    /// If the item was added again while it was processed, it is queued.
    pub fn done(&self, item: &T) {
        let mut state = self.inner.state();
        state.processing.remove(item);
        if state.dirty.contains(item) {
            state.queue.push_back(item.clone());
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    /// Stops accepting items and wakes every waiting worker.
    ///
    /// Items already queued are still handed out by [`get`](Self::get).
    pub fn shut_down(&self) {
        self.inner.state().shutting_down = true;
        self.inner.notify.notify_waiters();
    }

    /// Returns true once [`shut_down`](Self::shut_down) has been called.
    pub fn is_shutting_down(&self) -> bool {
        self.inner.state().shutting_down
    }

    /// Returns the number of items waiting to be processed.
    pub fn len(&self) -> usize {
        self.inner.state().queue.len()
    }

    /// Returns true if no item is waiting to be processed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> WorkQueue<String> {
        WorkQueue::with_rate_limiter(
            "test",
            ItemExponentialFailureRateLimiter::new(
                Duration::from_millis(100),
                Duration::from_secs(10),
            ),
        )
    }

    #[tokio::test]
    async fn test_add_deduplicates_waiting_items() {
        let queue = queue();
        assert_eq!(queue.name(), "test");
        queue.add("ns/a".to_string());
        queue.add("ns/a".to_string());
        queue.add("ns/b".to_string());

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.get().await.as_deref(), Some("ns/a"));
        assert_eq!(queue.get().await.as_deref(), Some("ns/b"));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_add_while_processing_requeues_once_after_done() {
        let queue = queue();
        queue.add("ns/a".to_string());

        let key = queue.get().await.unwrap();
        queue.add(key.clone());
        queue.add(key.clone());

        // Not handed out again while still processing
        assert!(queue.is_empty());

        queue.done(&key);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get().await, Some(key.clone()));
        queue.done(&key);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_done_without_readd_does_not_requeue() {
        let queue = queue();
        queue.add("ns/a".to_string());

        let key = queue.get().await.unwrap();
        queue.done(&key);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_get_waits_for_add() {
        let queue = queue();
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await })
        };

        tokio::task::yield_now().await;
        queue.add("ns/late".to_string());

        assert_eq!(waiter.await.unwrap().as_deref(), Some("ns/late"));
    }

    #[tokio::test]
    async fn test_shutdown_wakes_waiters() {
        let queue = queue();
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let queue = queue.clone();
                tokio::spawn(async move { queue.get().await })
            })
            .collect();

        tokio::task::yield_now().await;
        queue.shut_down();

        for waiter in waiters {
            assert_eq!(waiter.await.unwrap(), None);
        }
    }

    #[tokio::test]
    async fn test_shutdown_drains_queued_items() {
        let queue = queue();
        queue.add("ns/a".to_string());
        queue.shut_down();

        // New items are rejected, queued ones are still handed out
        queue.add("ns/b".to_string());
        assert_eq!(queue.get().await.as_deref(), Some("ns/a"));
        assert_eq!(queue.get().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_rate_limited_waits_for_backoff() {
        let queue = queue();
        queue.add_rate_limited("ns/a".to_string());
        assert!(queue.is_empty());
        assert_eq!(queue.num_requeues(&"ns/a".to_string()), 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(queue.is_empty());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(queue.len(), 1);

        // Second failure doubles the delay
        let key = queue.get().await.unwrap();
        queue.add_rate_limited(key.clone());
        queue.done(&key);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(queue.is_empty());
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(queue.len(), 1);

        queue.forget(&key);
        assert_eq!(queue.num_requeues(&key), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_after_is_dropped_after_shutdown() {
        let queue = queue();
        queue.add_after("ns/a".to_string(), Duration::from_secs(1));
        queue.shut_down();

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(queue.is_empty());
        assert_eq!(queue.get().await, None);
    }
}
