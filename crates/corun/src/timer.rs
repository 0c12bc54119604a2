// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Timed suspension: a managed timer service instead of a detached
//! thread per timer.
//!
//! One dedicated thread services a min-heap of deadlines. When a
//! deadline elapses the service wakes the registered waker, which hands
//! the suspended frame back to its scheduler (or unparks a synchronous
//! caller) — the frame never resumes on the timer thread. Cancelled
//! entries are tombstoned and removed lazily when they surface at the
//! top of the heap.

use std::cmp;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::task::{Context, Poll, Waker};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::trace;

/// A registered deadline in the heap.
struct TimerEntry {
    deadline: Instant,
    id: u64,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.id == other.id
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> cmp::Ordering {
        // BinaryHeap pops the greatest entry first; reverse so the
        // nearest deadline surfaces at the top.
        self.deadline
            .cmp(&other.deadline)
            .reverse()
            .then_with(|| self.id.cmp(&other.id).reverse())
    }
}

struct TimerInner {
    /// All deadlines, nearest first (including tombstoned entries).
    entries: BinaryHeap<TimerEntry>,
    /// Live registrations by id. An entry missing here was cancelled
    /// and is dropped when it reaches the top of the heap.
    active: HashMap<u64, Waker>,
}

struct TimerShared {
    inner: Mutex<TimerInner>,
    cvar: Condvar,
    shutdown: AtomicBool,
    next_id: AtomicU64,
}

/// Owns the service thread. Usually embedded in a `Scheduler`; usable
/// standalone for synchronous execution of sleeping tasks.
pub struct TimerService {
    shared: Arc<TimerShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl TimerService {
    pub fn new() -> Self {
        let shared = Arc::new(TimerShared {
            inner: Mutex::new(TimerInner {
                entries: BinaryHeap::new(),
                active: HashMap::new(),
            }),
            cvar: Condvar::new(),
            shutdown: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
        });

        let thread = {
            let shared = shared.clone();
            thread::Builder::new()
                .name("corun-timer".to_string())
                .spawn(move || timer_loop(&shared))
                .expect("failed to spawn timer thread")
        };

        Self {
            shared,
            thread: Mutex::new(Some(thread)),
        }
    }

    /// A cloneable handle for creating `Sleep` futures.
    pub fn handle(&self) -> TimerHandle {
        TimerHandle {
            shared: self.shared.clone(),
        }
    }

    /// Stop the service thread and join it. Pending entries are
    /// discarded; their wakers never fire. Idempotent.
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.cvar.notify_all();
        if let Some(handle) = self.thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl Default for TimerService {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TimerService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Handle for registering timed suspensions with a `TimerService`.
#[derive(Clone)]
pub struct TimerHandle {
    shared: Arc<TimerShared>,
}

impl TimerHandle {
    /// Suspend for `duration`. The deadline is `now + duration`,
    /// computed here; an already-passed deadline resolves on first poll
    /// without registering anything or yielding the thread.
    pub fn sleep(&self, duration: Duration) -> Sleep {
        Sleep {
            shared: self.shared.clone(),
            deadline: Instant::now() + duration,
            id: None,
        }
    }
}

/// Future that completes when its deadline has passed. Dropping a
/// pending `Sleep` cancels the registered entry.
pub struct Sleep {
    shared: Arc<TimerShared>,
    deadline: Instant,
    id: Option<u64>,
}

impl std::future::Future for Sleep {
    type Output = ();

    fn poll(self: std::pin::Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();

        if Instant::now() >= this.deadline {
            if let Some(id) = this.id.take() {
                // Fired or about to fire; drop the registration.
                this.shared.inner.lock().unwrap().active.remove(&id);
            }
            return Poll::Ready(());
        }

        match this.id {
            Some(id) => {
                let mut inner = this.shared.inner.lock().unwrap();
                match inner.active.get_mut(&id) {
                    // Re-poll before expiry: refresh the waker.
                    Some(waker) => *waker = cx.waker().clone(),
                    // Already fired between the deadline check and now.
                    None => return Poll::Ready(()),
                }
                Poll::Pending
            }
            None => {
                let id = this.shared.next_id.fetch_add(1, Ordering::Relaxed);
                {
                    let mut inner = this.shared.inner.lock().unwrap();
                    inner.entries.push(TimerEntry {
                        deadline: this.deadline,
                        id,
                    });
                    inner.active.insert(id, cx.waker().clone());
                }
                this.id = Some(id);
                // The nearest deadline may have changed; let the
                // service thread recompute its sleep.
                this.shared.cvar.notify_one();
                Poll::Pending
            }
        }
    }
}

impl Drop for Sleep {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            // Tombstone: the heap entry is removed lazily by the
            // service thread.
            self.shared.inner.lock().unwrap().active.remove(&id);
        }
    }
}

fn timer_loop(shared: &TimerShared) {
    let mut inner = shared.inner.lock().unwrap();

    loop {
        if shared.shutdown.load(Ordering::Acquire) {
            return;
        }

        let now = Instant::now();
        let mut nearest = None;

        {
            let TimerInner { entries, active } = &mut *inner;
            while let Some(top) = entries.peek() {
                if top.deadline > now && active.contains_key(&top.id) {
                    nearest = Some(top.deadline);
                    break;
                }
                let entry = entries.pop().unwrap();
                if let Some(waker) = active.remove(&entry.id) {
                    trace!("timer {} expired", entry.id);
                    waker.wake();
                }
                // Tombstoned entries fall through and are discarded.
            }
        }

        inner = match nearest {
            Some(deadline) => {
                let timeout = deadline.saturating_duration_since(Instant::now());
                shared.cvar.wait_timeout(inner, timeout).unwrap().0
            }
            None => shared.cvar.wait(inner).unwrap(),
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_on::block_on;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::atomic::AtomicBool;
    use std::task::Wake;

    struct NoopWake;

    impl Wake for NoopWake {
        fn wake(self: Arc<Self>) {}
    }

    fn noop_context_poll(sleep: &mut Sleep) -> Poll<()> {
        let waker = Waker::from(Arc::new(NoopWake));
        let mut cx = Context::from_waker(&waker);
        Pin::new(sleep).poll(&mut cx)
    }

    #[test]
    fn zero_duration_is_ready_on_first_poll() {
        let service = TimerService::new();
        let mut sleep = service.handle().sleep(Duration::ZERO);
        // No registration, no hand-off: ready immediately.
        assert_eq!(noop_context_poll(&mut sleep), Poll::Ready(()));
        assert!(service.shared.inner.lock().unwrap().active.is_empty());
    }

    #[test]
    fn sleep_waits_at_least_the_duration() {
        let service = TimerService::new();
        let start = Instant::now();
        block_on(service.handle().sleep(Duration::from_millis(40)));
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn elapsed_sleeps_resolve_without_registration() {
        let service = TimerService::new();
        let handle = service.handle();
        let sleep = handle.sleep(Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(5));
        let start = Instant::now();
        block_on(sleep);
        // The deadline had passed; no park happened.
        assert!(start.elapsed() < Duration::from_millis(40));
    }

    #[test]
    fn dropping_a_pending_sleep_cancels_it() {
        let service = TimerService::new();
        let mut sleep = service.handle().sleep(Duration::from_secs(60));
        assert_eq!(noop_context_poll(&mut sleep), Poll::Pending);
        assert_eq!(service.shared.inner.lock().unwrap().active.len(), 1);

        drop(sleep);
        assert!(service.shared.inner.lock().unwrap().active.is_empty());
    }

    #[test]
    fn multiple_sleeps_fire_in_deadline_order() {
        let service = TimerService::new();
        let handle = service.handle();
        let first_done = Arc::new(AtomicBool::new(false));

        let flag = first_done.clone();
        let short = handle.sleep(Duration::from_millis(10));
        let long = handle.sleep(Duration::from_millis(60));

        let watcher = std::thread::spawn(move || {
            block_on(short);
            flag.store(true, Ordering::Release);
        });

        block_on(long);
        assert!(first_done.load(Ordering::Acquire));
        watcher.join().unwrap();
    }

    #[test]
    fn shutdown_is_idempotent() {
        let service = TimerService::new();
        service.shutdown();
        service.shutdown();
    }
}
