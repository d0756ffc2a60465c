//! A rate limited, deduplicating work queue.
//!
//! Items are held at most once while waiting, and an item that is being
//! processed is never handed to a second worker: adding it again while it is
//! in flight marks it dirty, and it is queued once more when the first worker
//! calls [`WorkQueue::done`]. Adding an item equal to one that is already
//! waiting replaces the waiting copy, so the newest value is the one handed
//! out.

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::{debug, trace};
use tokio::sync::Notify;
use tokio::time::Instant;

/// Decides how long an item should wait before it is (re)queued.
pub trait RateLimiter<T>: Send + Sync {
    /// The delay for the next attempt at `item`. Counts as a requeue.
    fn when(&self, item: &T) -> Duration;

    /// Stops tracking `item`, resetting its backoff.
    fn forget(&self, item: &T);

    fn num_requeues(&self, item: &T) -> u32;
}

/// Per-item exponential backoff: `base * 2^failures`, capped at `max`.
pub struct ItemExponentialFailureRateLimiter<T> {
    base: Duration,
    max: Duration,
    failures: Mutex<HashMap<T, u32>>,
}

impl<T> ItemExponentialFailureRateLimiter<T> {
    pub fn new(base: Duration, max: Duration) -> Self {
        ItemExponentialFailureRateLimiter {
            base,
            max,
            failures: Mutex::default(),
        }
    }

    fn failures(&self) -> MutexGuard<'_, HashMap<T, u32>> {
        self.failures.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Eq + Hash + Clone + Send> RateLimiter<T> for ItemExponentialFailureRateLimiter<T> {
    fn when(&self, item: &T) -> Duration {
        let mut failures = self.failures();
        let count = failures.entry(item.clone()).or_insert(0);
        let exponent = *count;
        *count = count.saturating_add(1);

        2u32.checked_pow(exponent)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max, |backoff| backoff.min(self.max))
    }

    fn forget(&self, item: &T) {
        self.failures().remove(item);
    }

    fn num_requeues(&self, item: &T) -> u32 {
        self.failures().get(item).copied().unwrap_or(0)
    }
}

struct Bucket {
    tokens: f64,
    last: Instant,
}

/// An overall token bucket shared by every item: `qps` sustained, up to
/// `burst` at once. Requests beyond the bucket are delayed, never refused.
pub struct BucketRateLimiter {
    qps: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
}

impl BucketRateLimiter {
    pub fn new(qps: f64, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        BucketRateLimiter {
            qps,
            burst,
            bucket: Mutex::new(Bucket {
                tokens: burst,
                last: Instant::now(),
            }),
        }
    }
}

impl<T> RateLimiter<T> for BucketRateLimiter {
    fn when(&self, _item: &T) -> Duration {
        let mut bucket = self.bucket.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(bucket.last).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.qps).min(self.burst) - 1.0;
        bucket.last = now;

        if bucket.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-bucket.tokens / self.qps)
        }
    }

    fn forget(&self, _item: &T) {}

    fn num_requeues(&self, _item: &T) -> u32 {
        0
    }
}

/// The longest delay any of the inner limiters asks for.
pub struct MaxOfRateLimiter<T> {
    limiters: Vec<Box<dyn RateLimiter<T>>>,
}

impl<T> MaxOfRateLimiter<T> {
    pub fn new(limiters: Vec<Box<dyn RateLimiter<T>>>) -> Self {
        MaxOfRateLimiter { limiters }
    }
}

impl<T> RateLimiter<T> for MaxOfRateLimiter<T> {
    fn when(&self, item: &T) -> Duration {
        self.limiters
            .iter()
            .map(|limiter| limiter.when(item))
            .max()
            .unwrap_or(Duration::ZERO)
    }

    fn forget(&self, item: &T) {
        for limiter in &self.limiters {
            limiter.forget(item);
        }
    }

    fn num_requeues(&self, item: &T) -> u32 {
        self.limiters
            .iter()
            .map(|limiter| limiter.num_requeues(item))
            .max()
            .unwrap_or(0)
    }
}

/// Per-item exponential backoff from 5ms to 1000s, combined with an overall
/// 10 qps / 100 burst bucket.
pub fn default_controller_rate_limiter<T>() -> MaxOfRateLimiter<T>
where
    T: Eq + Hash + Clone + Send + 'static,
{
    MaxOfRateLimiter::new(vec![
        Box::new(ItemExponentialFailureRateLimiter::new(
            Duration::from_millis(5),
            Duration::from_secs(1000),
        )),
        Box::new(BucketRateLimiter::new(10.0, 100)),
    ])
}

struct State<T> {
    queue: VecDeque<T>,
    dirty: HashSet<T>,
    processing: HashSet<T>,
    shutting_down: bool,
}

pub struct WorkQueue<T> {
    name: &'static str,
    state: Mutex<State<T>>,
    available: Notify,
    limiter: Box<dyn RateLimiter<T>>,
}

impl<T> WorkQueue<T>
where
    T: Eq + Hash + Clone + Send + Sync + std::fmt::Debug + 'static,
{
    pub fn new(name: &'static str, limiter: impl RateLimiter<T> + 'static) -> Self {
        WorkQueue {
            name,
            state: Mutex::new(State {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                shutting_down: false,
            }),
            available: Notify::new(),
            limiter: Box::new(limiter),
        }
    }

    fn state(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues `item`, or replaces an equal item that is already waiting.
    /// Ignored after shutdown.
    pub fn add(&self, item: T) {
        self.insert(item, true);
    }

    fn insert(&self, item: T, replace: bool) {
        let mut state = self.state();
        if state.shutting_down {
            debug!("[{}] shutting down, discarding {item:?}", self.name);
            return;
        }
        if state.dirty.contains(&item) {
            if replace {
                state.dirty.replace(item);
            }
            return;
        }

        state.dirty.insert(item.clone());
        if state.processing.contains(&item) {
            trace!("[{}] {item:?} is in flight, requeueing when done", self.name);
            return;
        }

        state.queue.push_back(item);
        drop(state);
        self.available.notify_one();
    }

    /// Queues `item` once `delay` has elapsed. Never blocks the caller.
    pub fn add_after(self: &Arc<Self>, item: T, delay: Duration) {
        self.schedule(item, delay, true);
    }

    fn schedule(self: &Arc<Self>, item: T, delay: Duration, replace: bool) {
        if self.is_shutting_down() {
            debug!("[{}] shutting down, discarding {item:?}", self.name);
            return;
        }
        if delay.is_zero() {
            self.insert(item, replace);
            return;
        }

        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.insert(item, replace);
        });
    }

    /// Queues `item` after the delay the rate limiter assigns it.
    pub fn add_rate_limited(self: &Arc<Self>, item: T) {
        let delay = self.limiter.when(&item);
        trace!("[{}] {item:?} rate limited for {delay:?}", self.name);
        self.schedule(item, delay, true);
    }

    /// Retries a failed `item` after its backoff. Unlike
    /// [`WorkQueue::add_rate_limited`], an equal item that is already
    /// waiting is kept, since it is newer than the one that failed.
    pub fn requeue_rate_limited(self: &Arc<Self>, item: T) {
        let delay = self.limiter.when(&item);
        trace!("[{}] retrying {item:?} in {delay:?}", self.name);
        self.schedule(item, delay, false);
    }

    /// Waits for the next item. Returns `None` once the queue is shut down
    /// and every waiting item has been handed out.
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state();
                if let Some(queued) = state.queue.pop_front() {
                    let item = state.dirty.take(&queued).unwrap_or(queued);
                    state.processing.insert(item.clone());
                    return Some(item);
                }
                if state.shutting_down {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Marks `item` as no longer in flight, queueing it again if it was
    /// added while it was being processed.
    pub fn done(&self, item: &T) {
        let mut state = self.state();
        state.processing.remove(item);
        if let Some(latest) = state.dirty.get(item).cloned() {
            state.queue.push_back(latest);
            drop(state);
            self.available.notify_one();
        }
    }

    /// Resets the rate limiter's memory of `item`.
    pub fn forget(&self, item: &T) {
        self.limiter.forget(item);
    }

    pub fn num_requeues(&self, item: &T) -> u32 {
        self.limiter.num_requeues(item)
    }

    /// Number of items waiting to be handed out.
    pub fn len(&self) -> usize {
        self.state().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stops accepting new items. Items already waiting are still handed
    /// out; once they are drained [`WorkQueue::get`] returns `None`.
    pub fn shut_down(&self) {
        self.state().shutting_down = true;
        self.available.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state().shutting_down
    }
}
