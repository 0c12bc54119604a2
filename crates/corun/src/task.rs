// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Task handle, frame state machine, and continuation protocol.
//!
//! A `Task<T>` owns a frame: the runtime record of a deferred
//! computation. `Future::poll` is the resumption primitive — it
//! advances the frame on the calling thread until it suspends again or
//! reaches a terminal state, and is invoked uniformly by synchronous
//! looping (`run`), scheduler dispatch, and timer wakes.

use std::any::Any;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Wake, Waker};

use log::trace;

use crate::block_on::block_on;
use crate::error::TaskError;
use crate::scheduler::Scheduler;

/// Frame lifecycle states.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Declared (or woken and re-queued), not currently being resumed.
    Created = 0,
    /// Being resumed by some thread right now.
    Running = 1,
    /// Parked on an awaited sub-task or a timer.
    Suspended = 2,
    /// Finished with a value.
    Completed = 3,
    /// Finished with a captured error.
    Failed = 4,
}

impl TaskState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Created,
            1 => Self::Running,
            2 => Self::Suspended,
            3 => Self::Completed,
            _ => Self::Failed,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Type-erased suspended computation. The typed result is captured by
/// the wrapping future and written to a shared slot.
pub(crate) type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Re-enqueue callback installed on asynchronous submission.
pub(crate) type ScheduleFn = Arc<dyn Fn(Arc<RawFrame>) + Send + Sync>;

static NEXT_FRAME_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_AWAITER_ID: AtomicU64 = AtomicU64::new(1);

/// The per-task computation record.
///
/// Shared by `Arc` between the owning handle, the scheduler queue, and
/// wakers; the frame is only freed when the last reference drops, so
/// neither the scheduler nor a continuation callback can tear it down
/// under a live holder.
pub(crate) struct RawFrame {
    id: u64,
    state: AtomicU8,
    /// Set by the wrapping future when the computation panicked.
    failed: Arc<AtomicBool>,
    /// The suspended computation; `None` once terminal.
    future: Mutex<Option<BoxFuture>>,
    /// Re-enqueue callback. Installed at most once, on submission.
    schedule_fn: Mutex<Option<ScheduleFn>>,
    /// The single registered awaiter: (awaiter id, waker to resume it).
    continuation: Mutex<Option<(u64, Waker)>>,
}

impl RawFrame {
    pub(crate) fn new(future: BoxFuture, failed: Arc<AtomicBool>) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_FRAME_ID.fetch_add(1, Ordering::Relaxed),
            state: AtomicU8::new(TaskState::Created as u8),
            failed,
            future: Mutex::new(Some(future)),
            schedule_fn: Mutex::new(None),
            continuation: Mutex::new(None),
        })
    }

    pub(crate) fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Install the scheduler's re-enqueue callback. Returns false if a
    /// callback is already installed (the frame was submitted before).
    pub(crate) fn install_schedule_fn(&self, f: ScheduleFn) -> bool {
        let mut slot = self.schedule_fn.lock().unwrap();
        if slot.is_some() {
            return false;
        }
        *slot = Some(f);
        true
    }

    fn is_submitted(&self) -> bool {
        self.schedule_fn.lock().unwrap().is_some()
    }

    /// Push this frame's resumption token back onto its scheduler, if
    /// it has one. A no-op for frames driven inline.
    fn schedule(self: &Arc<Self>) {
        let f = self.schedule_fn.lock().unwrap().clone();
        if let Some(f) = f {
            f(self.clone());
        }
    }

    /// Register `waker` as the frame's single continuation. The same
    /// awaiter may re-register (updating its waker); a second distinct
    /// awaiter is refused.
    pub(crate) fn register_continuation(
        &self,
        awaiter: u64,
        waker: Waker,
    ) -> Result<(), TaskError> {
        let mut slot = self.continuation.lock().unwrap();
        match &*slot {
            Some((existing, _)) if *existing != awaiter => {
                Err(TaskError::MultipleAwaiters)
            }
            _ => {
                *slot = Some((awaiter, waker));
                Ok(())
            }
        }
    }

    /// Resume with the frame's own waker: the scheduler dispatch path.
    /// A wake re-enqueues the frame through `schedule_fn`.
    pub(crate) fn resume(self: &Arc<Self>) -> bool {
        let waker = Waker::from(Arc::new(FrameWaker { frame: self.clone() }));
        let mut cx = Context::from_waker(&waker);
        self.resume_with(&mut cx)
    }

    /// Advance the frame by one step: poll the stored future once with
    /// the given context. Returns true when the frame is terminal.
    pub(crate) fn resume_with(self: &Arc<Self>, cx: &mut Context<'_>) -> bool {
        let mut slot = self.future.lock().unwrap();
        let Some(fut) = slot.as_mut() else {
            // Already terminal; a stale token is harmless.
            return true;
        };

        self.state.store(TaskState::Running as u8, Ordering::Release);

        match fut.as_mut().poll(cx) {
            Poll::Ready(()) => {
                *slot = None;
                drop(slot);
                self.finish();
                true
            }
            Poll::Pending => {
                drop(slot);
                // Park the frame. If a wake arrived mid-poll it moved
                // the state Running -> Created and did not enqueue;
                // hand the token back ourselves so it isn't lost.
                let parked = self.state.compare_exchange(
                    TaskState::Running as u8,
                    TaskState::Suspended as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
                if parked.is_err() {
                    self.schedule();
                }
                false
            }
        }
    }

    /// Record the terminal state and resume the registered continuation
    /// exactly once. The state store precedes the wake so the awaiter
    /// observes a terminal frame.
    fn finish(self: &Arc<Self>) {
        let terminal = if self.failed.load(Ordering::Acquire) {
            TaskState::Failed
        } else {
            TaskState::Completed
        };
        self.state.store(terminal as u8, Ordering::Release);
        trace!("frame {} reached {:?}", self.id, terminal);

        let continuation = self.continuation.lock().unwrap().take();
        if let Some((_, waker)) = continuation {
            waker.wake();
        }
    }

    /// Mark the frame runnable again after a wake. Exactly one caller
    /// wins the Running/Suspended transition, so each suspend cycle
    /// produces at most one resumption token.
    fn wake_frame(self: &Arc<Self>) {
        loop {
            match self.state() {
                TaskState::Suspended => {
                    let woken = self.state.compare_exchange(
                        TaskState::Suspended as u8,
                        TaskState::Created as u8,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    );
                    if woken.is_ok() {
                        self.schedule();
                        return;
                    }
                }
                TaskState::Running => {
                    // A poll is in progress; flag the wake by moving to
                    // Created. The poller re-enqueues when its own park
                    // transition fails. If this CAS fails the state
                    // moved on; retry.
                    let flagged = self.state.compare_exchange(
                        TaskState::Running as u8,
                        TaskState::Created as u8,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    );
                    if flagged.is_ok() {
                        return;
                    }
                }
                // Created: already queued. Terminal: nothing to resume.
                _ => return,
            }
        }
    }
}

/// Waker that marks a frame runnable and re-enqueues it.
struct FrameWaker {
    frame: Arc<RawFrame>,
}

impl Wake for FrameWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.frame.wake_frame();
    }
}

/// Write-once result slot shared between the wrapping future and the
/// owning handle. The future writes; the handle takes.
pub(crate) struct ResultSlot<T> {
    inner: Mutex<Option<Result<T, TaskError>>>,
}

impl<T> ResultSlot<T> {
    fn new() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }

    fn set(&self, result: Result<T, TaskError>) {
        *self.inner.lock().unwrap() = Some(result);
    }

    fn take(&self) -> Option<Result<T, TaskError>> {
        self.inner.lock().unwrap().take()
    }
}

/// Future adaptor that converts a panic during poll into an error
/// payload instead of unwinding through the runtime.
struct CatchUnwind<F> {
    inner: F,
}

impl<F: Future> Future for CatchUnwind<F> {
    type Output = Result<F::Output, Box<dyn Any + Send + 'static>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // SAFETY: structural projection to the only field; the inner
        // future is never moved out of the pinned wrapper.
        let inner = unsafe { self.map_unchecked_mut(|s| &mut s.inner) };
        match panic::catch_unwind(AssertUnwindSafe(|| inner.poll(cx))) {
            Ok(Poll::Ready(value)) => Poll::Ready(Ok(value)),
            Ok(Poll::Pending) => Poll::Pending,
            Err(payload) => Poll::Ready(Err(payload)),
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send + 'static>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Owning handle to a deferred computation producing a `T`.
///
/// Created suspended; nothing runs until the first resumption. The
/// handle is the single owner — it moves, it never duplicates. Once the
/// result has been taken the handle is empty and further use reports
/// `BrokenPromise`.
pub struct Task<T> {
    raw: Option<Arc<RawFrame>>,
    result: Arc<ResultSlot<T>>,
    awaiter_id: u64,
}

impl<T: Send + 'static> Task<T> {
    /// Declare a task over `future`. Returns immediately in the
    /// `Created` state; the body does not execute yet.
    pub fn new<F>(future: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
    {
        let result = Arc::new(ResultSlot::new());
        let failed = Arc::new(AtomicBool::new(false));

        let slot = result.clone();
        let failed_flag = failed.clone();
        let wrapped = async move {
            match (CatchUnwind { inner: future }).await {
                Ok(value) => slot.set(Ok(value)),
                Err(payload) => {
                    failed_flag.store(true, Ordering::Release);
                    slot.set(Err(TaskError::Failed(panic_message(payload))));
                }
            }
        };

        Self {
            raw: Some(RawFrame::new(Box::pin(wrapped), failed)),
            result,
            awaiter_id: NEXT_AWAITER_ID.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Execute synchronously: resume on the calling thread, parking
    /// between suspensions, until terminal. A body that never suspends
    /// completes without any thread hand-off.
    pub fn run(self) -> Result<T, TaskError> {
        block_on(self)
    }

    /// Submit for asynchronous execution. Enqueues the frame's
    /// resumption token once; from then on the frame runs entirely on
    /// scheduler workers. A no-op for already-terminal or already
    /// submitted frames.
    pub fn submit(&mut self, scheduler: &Scheduler) -> Result<(), TaskError> {
        let raw = self.raw.as_ref().ok_or(TaskError::BrokenPromise)?;
        if !raw.state().is_terminal() {
            scheduler.submit(raw.clone());
        }
        Ok(())
    }

    /// Block the calling thread until the task is terminal, then return
    /// its result. The blocking form of awaiting, for non-async callers.
    pub fn wait(self) -> Result<T, TaskError> {
        block_on(self)
    }

    /// The stored value or captured error. Valid only once a terminal
    /// state is reached: `NotReady` before that, `BrokenPromise` from
    /// an empty handle. The value moves out; the handle is empty after.
    pub fn result(&mut self) -> Result<T, TaskError> {
        let raw = self.raw.as_ref().ok_or(TaskError::BrokenPromise)?;
        if !raw.state().is_terminal() {
            return Err(TaskError::NotReady);
        }
        self.take_result()
    }

    /// Current frame state, or `None` for an empty handle.
    pub fn state(&self) -> Option<TaskState> {
        self.raw.as_ref().map(|raw| raw.state())
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state(), Some(state) if state.is_terminal())
    }

    fn take_result(&mut self) -> Result<T, TaskError> {
        self.raw = None;
        self.result.take().unwrap_or(Err(TaskError::BrokenPromise))
    }
}

/// The awaiting contract: polling a `Task` resumes it (or registers the
/// caller as its continuation) and yields its result when terminal.
///
/// A child that was never submitted is driven inline with the caller's
/// waker — synchronous nesting, as `co_await` on a cold coroutine. A
/// submitted child instead records the caller as its single
/// continuation and completion wakes the caller.
impl<T: Send + 'static> Future for Task<T> {
    type Output = Result<T, TaskError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let Some(raw) = this.raw.as_ref() else {
            return Poll::Ready(Err(TaskError::BrokenPromise));
        };

        if raw.state().is_terminal() {
            return Poll::Ready(this.take_result());
        }

        if raw.is_submitted() {
            // Register first, then re-check: if the frame completed in
            // between, the result is ready now and the spurious wake is
            // harmless.
            if let Err(e) =
                raw.register_continuation(this.awaiter_id, cx.waker().clone())
            {
                return Poll::Ready(Err(e));
            }
            if raw.state().is_terminal() {
                return Poll::Ready(this.take_result());
            }
            return Poll::Pending;
        }

        // Not submitted: drive the child inline on this thread. Its
        // suspension sources hold the caller's waker, so a timer wake
        // resumes the caller, which re-polls the child.
        let raw = raw.clone();
        if raw.resume_with(cx) {
            Poll::Ready(this.take_result())
        } else {
            Poll::Pending
        }
    }
}
