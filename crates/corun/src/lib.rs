// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Cooperative task runtime.
//!
//! Sequential-looking code whose execution is split into resumable
//! steps, plus a scheduler that drives those steps to completion across
//! worker threads. A `Task<T>` is a single-owner handle to a deferred
//! computation; awaiting one suspends the caller until the child
//! reaches a terminal state, and the finishing child wakes its single
//! registered awaiter. Timed suspension goes through a managed timer
//! service that re-enqueues frames on the scheduler when deadlines
//! elapse.
//!
//! Components:
//! - `task`      — Task handle, frame state machine, continuation protocol
//! - `queue`     — blocking FIFO queue and LIFO stack for work items
//! - `scheduler` — worker threads resuming frames from the shared queue
//! - `timer`     — deadline min-heap serviced by a dedicated thread
//! - `block_on`  — synchronous driver (run a task on the calling thread)
//! - `error`     — explicit error kinds instead of unwinding

pub mod block_on;
pub mod error;
pub mod queue;
pub mod scheduler;
pub mod task;
pub mod timer;

pub use block_on::block_on;
pub use error::TaskError;
pub use queue::{BlockingQueue, BlockingStack};
pub use scheduler::Scheduler;
pub use task::{Task, TaskState};
pub use timer::{Sleep, TimerHandle, TimerService};
