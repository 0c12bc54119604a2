// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Blocking work queue and stack.
//!
//! Monitor-protected FIFO queue and LIFO stack over `VecDeque`. The
//! scheduler holds resumption tokens in the queue; both containers are
//! generic so they can carry any work item. Push and pop are
//! linearizable: the emptiness check and the removal happen under one
//! lock, so no item is delivered twice or lost once pushed.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// FIFO blocking queue. `push` wakes exactly one blocked waiter.
pub struct BlockingQueue<T> {
    items: Mutex<VecDeque<T>>,
    not_empty: Condvar,
}

impl<T> BlockingQueue<T> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            not_empty: Condvar::new(),
        }
    }

    /// Append an item and wake one waiter. Never fails.
    pub fn push(&self, item: T) {
        self.items.lock().unwrap().push_back(item);
        self.not_empty.notify_one();
    }

    /// Remove the oldest item, or return `None` immediately when empty.
    pub fn try_pop(&self) -> Option<T> {
        self.items.lock().unwrap().pop_front()
    }

    /// Block until an item is available, then remove and return it.
    pub fn wait_and_pop(&self) -> T {
        let mut items = self.items.lock().unwrap();
        loop {
            if let Some(item) = items.pop_front() {
                return item;
            }
            items = self.not_empty.wait(items).unwrap();
        }
    }

    /// As `wait_and_pop`, but give up after `timeout`.
    pub fn timed_wait_and_pop(&self, timeout: Duration) -> Option<T> {
        let items = self.items.lock().unwrap();
        let (mut items, _timed_out) = self
            .not_empty
            .wait_timeout_while(items, timeout, |q| q.is_empty())
            .unwrap();
        items.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().unwrap().is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }
}

impl<T> Default for BlockingQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// LIFO blocking stack: most-recently-pushed-first. Same delivery
/// guarantees as the queue, different order.
pub struct BlockingStack<T> {
    items: Mutex<VecDeque<T>>,
    not_empty: Condvar,
}

impl<T> BlockingStack<T> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            not_empty: Condvar::new(),
        }
    }

    /// Push an item and wake one waiter. Never fails.
    pub fn push(&self, item: T) {
        self.items.lock().unwrap().push_back(item);
        self.not_empty.notify_one();
    }

    /// Remove the newest item, or return `None` immediately when empty.
    pub fn try_pop(&self) -> Option<T> {
        self.items.lock().unwrap().pop_back()
    }

    /// Block until an item is available, then remove and return it.
    pub fn wait_and_pop(&self) -> T {
        let mut items = self.items.lock().unwrap();
        loop {
            if let Some(item) = items.pop_back() {
                return item;
            }
            items = self.not_empty.wait(items).unwrap();
        }
    }

    /// As `wait_and_pop`, but give up after `timeout`.
    pub fn timed_wait_and_pop(&self, timeout: Duration) -> Option<T> {
        let items = self.items.lock().unwrap();
        let (mut items, _timed_out) = self
            .not_empty
            .wait_timeout_while(items, timeout, |q| q.is_empty())
            .unwrap();
        items.pop_back()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().unwrap().is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }
}

impl<T: Clone> BlockingStack<T> {
    /// Peek at the newest item without removing it.
    pub fn try_top(&self) -> Option<T> {
        self.items.lock().unwrap().back().cloned()
    }

    /// Block until an item is available, then return a copy of the
    /// newest one without removing it.
    pub fn wait_and_top(&self) -> T {
        let mut items = self.items.lock().unwrap();
        loop {
            if let Some(item) = items.back() {
                return item.clone();
            }
            items = self.not_empty.wait(items).unwrap();
        }
    }
}

impl<T> Default for BlockingStack<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn queue_fifo_order() {
        let q = BlockingQueue::new();
        q.push(1);
        q.push(2);
        q.push(3);
        assert_eq!(q.try_pop(), Some(1));
        assert_eq!(q.try_pop(), Some(2));
        assert_eq!(q.try_pop(), Some(3));
        assert_eq!(q.try_pop(), None);
    }

    #[test]
    fn stack_lifo_order() {
        let s = BlockingStack::new();
        s.push(1);
        s.push(2);
        s.push(3);
        assert_eq!(s.try_pop(), Some(3));
        assert_eq!(s.try_pop(), Some(2));
        assert_eq!(s.try_pop(), Some(1));
        assert_eq!(s.try_pop(), None);
    }

    #[test]
    fn try_pop_empty_does_not_block() {
        let q: BlockingQueue<i32> = BlockingQueue::new();
        assert_eq!(q.try_pop(), None);
        assert!(q.is_empty());
        assert_eq!(q.len(), 0);
    }

    #[test]
    fn timed_wait_gives_up() {
        let q: BlockingQueue<i32> = BlockingQueue::new();
        let start = Instant::now();
        let popped = q.timed_wait_and_pop(Duration::from_millis(20));
        assert_eq!(popped, None);
        assert!(start.elapsed() >= Duration::from_millis(19));
    }

    #[test]
    fn wait_and_pop_wakes_on_push() {
        let q = Arc::new(BlockingQueue::new());
        let producer = {
            let q = q.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(10));
                q.push(7);
            })
        };
        assert_eq!(q.wait_and_pop(), 7);
        producer.join().unwrap();
    }

    #[test]
    fn stack_peek_operations() {
        let s = BlockingStack::new();
        assert_eq!(s.try_top(), None);
        s.push(1);
        s.push(2);
        assert_eq!(s.try_top(), Some(2));
        assert_eq!(s.wait_and_top(), 2);
        // Peeking removes nothing.
        assert_eq!(s.len(), 2);
    }

    #[test]
    fn each_item_delivered_exactly_once() {
        const PRODUCERS: usize = 4;
        const CONSUMERS: usize = 4;
        const PER_PRODUCER: usize = 250;

        let q = Arc::new(BlockingQueue::new());
        let mut handles = Vec::new();

        for p in 0..PRODUCERS {
            let q = q.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..PER_PRODUCER {
                    q.push(p * PER_PRODUCER + i);
                }
            }));
        }

        let mut consumers = Vec::new();
        for _ in 0..CONSUMERS {
            let q = q.clone();
            consumers.push(std::thread::spawn(move || {
                let mut seen = Vec::new();
                while let Some(item) = q.timed_wait_and_pop(Duration::from_millis(50)) {
                    seen.push(item);
                }
                seen
            }));
        }

        for h in handles {
            h.join().unwrap();
        }

        let mut all = HashSet::new();
        let mut total = 0;
        for c in consumers {
            for item in c.join().unwrap() {
                total += 1;
                assert!(all.insert(item), "item {} delivered twice", item);
            }
        }
        assert_eq!(total, PRODUCERS * PER_PRODUCER);
    }

    #[test]
    fn single_producer_fifo_preserved_across_threads() {
        let q = Arc::new(BlockingQueue::new());
        for i in 0..100 {
            q.push(i);
        }
        let consumer = {
            let q = q.clone();
            std::thread::spawn(move || {
                let mut out = Vec::new();
                for _ in 0..100 {
                    out.push(q.wait_and_pop());
                }
                out
            })
        };
        let out = consumer.join().unwrap();
        assert_eq!(out, (0..100).collect::<Vec<_>>());
    }
}
