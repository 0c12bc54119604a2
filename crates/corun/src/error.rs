// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Error kinds surfaced when driving or reading a task.

/// Error returned by task execution and result retrieval.
///
/// A failure inside a task's own body is captured into the frame's
/// terminal state and only surfaces here, from `result()`, `run()`,
/// `wait()`, or an await — never out of the scheduler loop.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    /// The handle is empty: its result was already taken, or it never
    /// held a frame. Awaiting or reading such a handle is a usage error.
    #[error("broken promise: task handle is empty or already consumed")]
    BrokenPromise,

    /// `result()` was called before the frame reached a terminal state.
    #[error("task has not reached a terminal state yet")]
    NotReady,

    /// A second task tried to register as the continuation of a frame
    /// that already has one. A frame supports a single awaiter.
    #[error("task already has a registered awaiter")]
    MultipleAwaiters,

    /// The task's computation panicked; the payload is preserved.
    #[error("task failed: {0}")]
    Failed(String),
}
