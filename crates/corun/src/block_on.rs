// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Synchronous driver: poll a future to completion on the calling
//! thread, parking between suspensions. Backs `Task::run` and
//! `Task::wait`; needs no scheduler and spawns nothing.

use std::future::Future;
use std::pin::pin;
use std::sync::Arc;
use std::task::{Context, Poll, Wake, Waker};
use std::thread::{self, Thread};

/// Waker that unparks the blocked thread.
struct ThreadUnparker {
    thread: Thread,
}

impl Wake for ThreadUnparker {
    fn wake(self: Arc<Self>) {
        self.thread.unpark();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.thread.unpark();
    }
}

/// Drive `future` until it completes. A future that never suspends
/// returns in a single poll without parking.
pub fn block_on<F: Future>(future: F) -> F::Output {
    let mut future = pin!(future);
    let waker = Waker::from(Arc::new(ThreadUnparker {
        thread: thread::current(),
    }));
    let mut cx = Context::from_waker(&waker);

    loop {
        match future.as_mut().poll(&mut cx) {
            Poll::Ready(output) => return output,
            // A wake between poll and park leaves the unpark token set,
            // so the park returns immediately; spurious unparks only
            // cost a re-poll.
            Poll::Pending => thread::park(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn ready_future_completes_in_one_poll() {
        assert_eq!(block_on(std::future::ready(9)), 9);
    }

    #[test]
    fn pending_future_resumes_on_wake() {
        // A future that yields once, waking itself, then completes.
        struct YieldOnce(bool);

        impl Future for YieldOnce {
            type Output = u32;

            fn poll(
                mut self: std::pin::Pin<&mut Self>,
                cx: &mut Context<'_>,
            ) -> Poll<u32> {
                if self.0 {
                    return Poll::Ready(3);
                }
                self.0 = true;
                cx.waker().wake_by_ref();
                Poll::Pending
            }
        }

        assert_eq!(block_on(YieldOnce(false)), 3);
    }

    #[test]
    fn wake_from_another_thread() {
        struct External(std::sync::Arc<std::sync::atomic::AtomicBool>);

        impl Future for External {
            type Output = ();

            fn poll(
                self: std::pin::Pin<&mut Self>,
                cx: &mut Context<'_>,
            ) -> Poll<()> {
                if self.0.load(std::sync::atomic::Ordering::Acquire) {
                    Poll::Ready(())
                } else {
                    let flag = self.0.clone();
                    let waker = cx.waker().clone();
                    thread::spawn(move || {
                        thread::sleep(Duration::from_millis(10));
                        flag.store(true, std::sync::atomic::Ordering::Release);
                        waker.wake();
                    });
                    Poll::Pending
                }
            }
        }

        let flag = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        block_on(External(flag.clone()));
        assert!(flag.load(std::sync::atomic::Ordering::Acquire));
    }
}
