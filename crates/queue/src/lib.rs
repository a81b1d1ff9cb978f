//! Vigil work queue: deduplicating, rate-limited queue of keys awaiting processing.
//!
//! Guarantees, per key:
//! - at most one copy is ready at any time (`add` coalesces);
//! - at most one `get` hands it out until the matching `done` (in-flight exclusion);
//! - an `add` while in flight is remembered and delivered once after `done`.
//!
//! Delayed adds are held in a deadline heap and promoted by `get`; there are no timer tasks.

#![forbid(unsafe_code)]

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, VecDeque};
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use metrics::{counter, gauge};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

mod rate_limit;

pub use rate_limit::{
    controller_rate_limiter, default_controller_rate_limiter, BucketRateLimiter, ItemExponentialRateLimiter,
    MaxOfRateLimiter, RateLimitConfig, RateLimiter, MAX_DELAY,
};

struct Waiting<K> {
    at: Instant,
    seq: u64,
    key: K,
}

impl<K> PartialEq for Waiting<K> {
    fn eq(&self, other: &Self) -> bool { self.at == other.at && self.seq == other.seq }
}
impl<K> Eq for Waiting<K> {}
impl<K> PartialOrd for Waiting<K> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> { Some(self.cmp(other)) }
}
impl<K> Ord for Waiting<K> {
    fn cmp(&self, other: &Self) -> Ordering { (self.at, self.seq).cmp(&(other.at, other.seq)) }
}

struct State<K> {
    ready: VecDeque<K>,
    /// Keys that need processing: everything in `ready` plus keys re-added while in flight.
    dirty: FxHashSet<K>,
    processing: FxHashSet<K>,
    waiting: BinaryHeap<Reverse<Waiting<K>>>,
    /// Earliest pending deadline per key; heap entries with another deadline are stale.
    waiting_at: FxHashMap<K, Instant>,
    seq: u64,
    shutting_down: bool,
}

impl<K: Eq + Hash + Clone> State<K> {
    /// Returns true when the key became ready.
    fn add(&mut self, key: K) -> bool {
        if self.shutting_down || self.dirty.contains(&key) { return false; }
        self.dirty.insert(key.clone());
        if self.processing.contains(&key) { return false; }
        self.ready.push_back(key);
        true
    }

    fn promote_due(&mut self, now: Instant) -> usize {
        let mut promoted = 0;
        while let Some(Reverse(top)) = self.waiting.peek() {
            if top.at > now { break; }
            let Some(Reverse(entry)) = self.waiting.pop() else { break };
            if self.waiting_at.get(&entry.key) != Some(&entry.at) { continue; }
            self.waiting_at.remove(&entry.key);
            if self.add(entry.key) { promoted += 1; }
        }
        promoted
    }

    fn next_deadline(&self) -> Option<Instant> { self.waiting.peek().map(|Reverse(w)| w.at) }
}

pub struct WorkQueue<K> {
    state: Mutex<State<K>>,
    notify: Notify,
    limiter: Box<dyn RateLimiter<K>>,
}

impl<K> WorkQueue<K>
where
    K: Eq + Hash + Clone + Send + Sync + std::fmt::Debug + 'static,
{
    pub fn new(limiter: impl RateLimiter<K> + 'static) -> Self {
        Self {
            state: Mutex::new(State {
                ready: VecDeque::new(),
                dirty: FxHashSet::default(),
                processing: FxHashSet::default(),
                waiting: BinaryHeap::new(),
                waiting_at: FxHashMap::default(),
                seq: 0,
                shutting_down: false,
            }),
            notify: Notify::new(),
            limiter: Box::new(limiter),
        }
    }

    pub fn with_default_limiter() -> Self { Self::new(default_controller_rate_limiter()) }

    fn lock(&self) -> MutexGuard<'_, State<K>> { self.state.lock().unwrap_or_else(PoisonError::into_inner) }

    /// Mark `key` as needing processing. Coalesces with a pending copy; defers while in flight.
    pub fn add(&self, key: K) {
        let pushed = {
            let mut st = self.lock();
            let pushed = st.add(key);
            gauge!("vigil_workqueue_depth", st.ready.len() as f64);
            pushed
        };
        counter!("vigil_workqueue_adds_total", 1);
        if pushed { self.notify.notify_one(); }
    }

    /// Add `key` once `delay` (clamped to [`MAX_DELAY`]) has elapsed. A pending earlier
    /// deadline for the same key wins.
    pub fn add_after(&self, key: K, delay: Duration) {
        if delay.is_zero() { return self.add(key); }
        let at = Instant::now() + delay.min(MAX_DELAY);
        {
            let mut st = self.lock();
            if st.shutting_down { return; }
            if let Some(existing) = st.waiting_at.get(&key) {
                if *existing <= at { return; }
            }
            st.seq += 1;
            let seq = st.seq;
            st.waiting_at.insert(key.clone(), at);
            st.waiting.push(Reverse(Waiting { at, seq, key }));
        }
        // Sleeping getters recompute their deadline.
        self.notify.notify_waiters();
    }

    /// Re-add `key` after the limiter's backoff for it, recording one more requeue.
    pub fn add_rate_limited(&self, key: K) {
        let delay = self.limiter.when(&key);
        debug!(key = ?key, delay_ms = delay.as_millis() as u64, "requeue with backoff");
        counter!("vigil_workqueue_retries_total", 1);
        self.add_after(key, delay);
    }

    pub fn forget(&self, key: &K) { self.limiter.forget(key); }

    pub fn num_requeues(&self, key: &K) -> u32 { self.limiter.num_requeues(key) }

    /// Wait for the next ready key and claim it. `None` once shut down and drained.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let deadline = {
                let mut st = self.lock();
                st.promote_due(Instant::now());
                if let Some(key) = st.ready.pop_front() {
                    st.dirty.remove(&key);
                    st.processing.insert(key.clone());
                    gauge!("vigil_workqueue_depth", st.ready.len() as f64);
                    return Some(key);
                }
                if st.shutting_down { return None; }
                st.next_deadline()
            };

            match deadline {
                Some(at) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Release the claim taken by `get`. Re-queues the key if it was added meanwhile.
    pub fn done(&self, key: &K) {
        let requeued = {
            let mut st = self.lock();
            st.processing.remove(key);
            if st.dirty.contains(key) && !st.shutting_down {
                st.ready.push_back(key.clone());
                true
            } else {
                false
            }
        };
        if requeued { self.notify.notify_one(); }
    }

    /// Stop accepting keys and wake every waiting `get`. Ready keys are still handed out.
    pub fn shut_down(&self) {
        {
            let mut st = self.lock();
            st.shutting_down = true;
            st.waiting.clear();
            st.waiting_at.clear();
        }
        self.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool { self.lock().shutting_down }

    /// Number of ready keys.
    pub fn len(&self) -> usize { self.lock().ready.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Number of keys waiting on a delayed add.
    pub fn waiting_len(&self) -> usize { self.lock().waiting_at.len() }

    pub fn is_processing(&self, key: &K) -> bool { self.lock().processing.contains(key) }
}
