// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Worker threads resuming frames from a shared blocking queue.
//!
//! The scheduler is an explicitly constructed object: callers hold it
//! and pass it to whoever needs to submit work, so multiple independent
//! schedulers can coexist and shut down deterministically. Workers all
//! pop from the one queue; its atomic pop delivers each resumption
//! token to exactly one worker. A frame that fails terminates into its
//! own `Failed` state — the loop keeps going.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, trace};

use crate::queue::BlockingQueue;
use crate::task::RawFrame;
use crate::timer::{TimerHandle, TimerService};

/// How long a worker blocks on the queue before re-checking shutdown.
const PARK_INTERVAL: Duration = Duration::from_millis(5);

/// Drives submitted frames to completion on one or more worker threads.
pub struct Scheduler {
    shared: Arc<Shared>,
    timer: TimerService,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// State shared between workers and submitters.
struct Shared {
    /// Resumption tokens waiting for a worker.
    queue: BlockingQueue<Arc<RawFrame>>,
    /// Submitted frames that have not reached a terminal state.
    active: AtomicUsize,
    /// Signalled when `active` drops to zero.
    quiescent: (Mutex<()>, Condvar),
    /// Tells workers to exit once the queue is drained.
    shutdown: AtomicBool,
}

impl Scheduler {
    /// Start `workers` worker threads (0 = available parallelism) and
    /// the timer service thread.
    pub fn new(workers: usize) -> Self {
        let count = if workers == 0 {
            thread::available_parallelism().map(|p| p.get()).unwrap_or(4)
        } else {
            workers
        };

        let shared = Arc::new(Shared {
            queue: BlockingQueue::new(),
            active: AtomicUsize::new(0),
            quiescent: (Mutex::new(()), Condvar::new()),
            shutdown: AtomicBool::new(false),
        });

        let mut handles = Vec::with_capacity(count);
        for id in 0..count {
            let shared = shared.clone();
            handles.push(
                thread::Builder::new()
                    .name(format!("corun-worker-{}", id))
                    .spawn(move || worker_loop(id, &shared))
                    .expect("failed to spawn worker thread"),
            );
        }

        Self {
            shared,
            timer: TimerService::new(),
            workers: Mutex::new(handles),
        }
    }

    /// Enqueue a frame for asynchronous execution.
    ///
    /// Installs the re-enqueue callback wakers use, then pushes the
    /// frame's token once. A frame that was already submitted keeps its
    /// original callback and is not enqueued again.
    pub(crate) fn submit(&self, frame: Arc<RawFrame>) {
        let shared = self.shared.clone();
        let installed = frame.install_schedule_fn(Arc::new(
            move |frame: Arc<RawFrame>| {
                shared.queue.push(frame);
            },
        ));
        if !installed {
            return;
        }

        self.shared.active.fetch_add(1, Ordering::AcqRel);
        self.shared.queue.push(frame);
    }

    /// Timer handle for creating timed suspensions that resume on this
    /// scheduler's workers.
    pub fn timer(&self) -> TimerHandle {
        self.timer.handle()
    }

    /// Wait until every submitted frame is terminal, then stop and join
    /// the workers and the timer thread. Also run on drop.
    pub fn shutdown(&self) {
        {
            let (lock, cvar) = &self.shared.quiescent;
            let mut guard = lock.lock().unwrap();
            while self.shared.active.load(Ordering::Acquire) > 0 {
                guard = cvar.wait(guard).unwrap();
            }
        }

        self.shared.shutdown.store(true, Ordering::Release);
        self.timer.shutdown();

        let mut workers = self.workers.lock().unwrap();
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if !self.shared.shutdown.load(Ordering::Acquire) {
            self.shutdown();
        }
    }
}

/// Worker main loop: pop a token, resume the frame, repeat. The
/// bounded wait keeps shutdown observable without a drain signal in
/// the queue itself.
fn worker_loop(id: usize, shared: &Shared) {
    debug!("worker {} started", id);

    loop {
        if let Some(frame) = shared.queue.timed_wait_and_pop(PARK_INTERVAL) {
            run_frame(frame, shared);
            continue;
        }
        if shared.shutdown.load(Ordering::Acquire) {
            break;
        }
    }

    // Drain whatever is left so no token is lost on the way out.
    while let Some(frame) = shared.queue.try_pop() {
        run_frame(frame, shared);
    }

    debug!("worker {} stopped", id);
}

/// Resume one frame. A frame that suspends again re-enqueues itself
/// through its waker when it is next woken; a terminal frame retires.
fn run_frame(frame: Arc<RawFrame>, shared: &Shared) {
    trace!("resuming frame on {:?}", thread::current().name());

    if frame.resume() {
        if shared.active.fetch_sub(1, Ordering::AcqRel) == 1 {
            let (lock, cvar) = &shared.quiescent;
            let _guard = lock.lock().unwrap();
            cvar.notify_all();
        }
    }
}
