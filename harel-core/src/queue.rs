//! Event queues.
//!
//! The internal queue belongs to the engine and is only touched from its own
//! control flow. The external queue is the one place other threads meet the
//! engine: producers push from anywhere, the engine pops one event at a time.

use crate::error::CoreError;
use crate::event::Event;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

/// FIFO of events raised by executable content and by the engine.
#[derive(Debug, Default)]
pub struct InternalQueue {
    events: VecDeque<Event>,
}

impl InternalQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: Event) {
        self.events.push_back(event);
    }

    pub fn pop(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }
}

#[derive(Debug, Default)]
struct Shared {
    events: VecDeque<Event>,
    closed: bool,
}

/// Thread-safe FIFO of host events. Cloning yields another handle to the
/// same queue.
#[derive(Debug, Clone, Default)]
pub struct ExternalQueue {
    inner: Arc<(Mutex<Shared>, Condvar)>,
}

impl ExternalQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an event; fails once the queue is closed.
    pub fn push(&self, event: Event) -> Result<(), CoreError> {
        let (lock, ready) = &*self.inner;
        let mut shared = lock.lock();
        if shared.closed {
            return Err(CoreError::QueueClosed);
        }
        tracing::trace!(event = event.name(), "external event queued");
        shared.events.push_back(event);
        ready.notify_one();
        Ok(())
    }

    /// Takes the next event without blocking.
    pub fn pop(&self) -> Option<Event> {
        let (lock, _) = &*self.inner;
        let mut shared = lock.lock();
        if shared.closed {
            return None;
        }
        shared.events.pop_front()
    }

    /// Blocks until an event arrives; `None` once the queue is closed.
    pub fn wait(&self) -> Option<Event> {
        let (lock, ready) = &*self.inner;
        let mut shared = lock.lock();
        loop {
            if shared.closed {
                return None;
            }
            if let Some(event) = shared.events.pop_front() {
                return Some(event);
            }
            ready.wait(&mut shared);
        }
    }

    /// Like [`ExternalQueue::wait`] but gives up after `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Event> {
        let (lock, ready) = &*self.inner;
        let mut shared = lock.lock();
        if shared.events.is_empty() && !shared.closed {
            ready.wait_for(&mut shared, timeout);
        }
        if shared.closed {
            return None;
        }
        shared.events.pop_front()
    }

    /// Closes the queue. Pending events are dropped and waiters wake up;
    /// the engine treats this as a stop request.
    pub fn close(&self) {
        let (lock, ready) = &*self.inner;
        let mut shared = lock.lock();
        shared.closed = true;
        shared.events.clear();
        ready.notify_all();
    }

    /// Reopens a closed queue so an engine can be started again. Anything
    /// left over from before the close is discarded.
    pub fn reopen(&self) {
        let (lock, _) = &*self.inner;
        let mut shared = lock.lock();
        shared.closed = false;
        shared.events.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.0.lock().closed
    }

    pub fn len(&self) -> usize {
        self.inner.0.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_internal_fifo() {
        let mut queue = InternalQueue::new();
        queue.push(Event::internal("a"));
        queue.push(Event::internal("b"));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop().unwrap().name(), "a");
        assert_eq!(queue.pop().unwrap().name(), "b");
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_external_fifo_across_handles() {
        let queue = ExternalQueue::new();
        let producer = queue.clone();
        producer.push(Event::new("one")).unwrap();
        producer.push(Event::new("two")).unwrap();
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop().unwrap().name(), "one");
        assert_eq!(queue.pop().unwrap().name(), "two");
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_concurrent_producers_serialize() {
        let queue = ExternalQueue::new();
        let handles: Vec<_> = (0..4)
            .map(|p| {
                let q = queue.clone();
                thread::spawn(move || {
                    for i in 0..25 {
                        q.push(Event::new(format!("p{}.{}", p, i))).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let mut seen = 0;
        let mut last_per_producer = [None::<usize>; 4];
        while let Some(event) = queue.pop() {
            let (p, i) = event.name()[1..].split_once('.').unwrap();
            let (p, i): (usize, usize) = (p.parse().unwrap(), i.parse().unwrap());
            if let Some(prev) = last_per_producer[p] {
                assert!(i > prev, "per-producer order must be preserved");
            }
            last_per_producer[p] = Some(i);
            seen += 1;
        }
        assert_eq!(seen, 100);
    }

    #[test]
    fn test_wait_wakes_on_push_and_close() {
        let queue = ExternalQueue::new();
        let producer = queue.clone();
        let t = thread::spawn(move || {
            producer.push(Event::new("late")).unwrap();
        });
        assert_eq!(queue.wait().unwrap().name(), "late");
        t.join().unwrap();

        let closer = queue.clone();
        let t = thread::spawn(move || closer.close());
        assert!(queue.wait().is_none());
        t.join().unwrap();
        assert!(matches!(
            queue.push(Event::new("x")),
            Err(CoreError::QueueClosed)
        ));

        queue.reopen();
        queue.push(Event::new("again")).unwrap();
        assert_eq!(queue.pop().unwrap().name(), "again");
    }

    #[test]
    fn test_wait_timeout_returns_none_when_idle() {
        let queue = ExternalQueue::new();
        assert!(queue.wait_timeout(Duration::from_millis(10)).is_none());
    }
}
