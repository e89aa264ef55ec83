// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Multiple-producer, multiple-consumer FIFO with a capacity limit and
//! timeout-based blocking operations.
//!
//! A [`Queue`] is a single handle over both ends of a flume channel. Cloning
//! the handle shares the underlying channel, so the workers of adjacent
//! stages all observe the same buffer. The flume errors are mapped onto the
//! crate's [`SendError`]/[`RecvError`] taxonomy: a timed-out put is `Full`,
//! a timed-out get is `Empty`, and both turn into `Closed` once the queue
//! has been closed.
//!
//! Closing is a cooperative flag rather than a teardown: elements still in
//! the buffer remain retrievable (so a shutdown path can drain them), but
//! new puts are refused.

use crate::error::{RecvError, SendError};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

/// Source of unique queue ids, used to assert the structural identity of the
/// wiring (two handles with the same id share the same buffer).
static NEXT_QUEUE_ID: AtomicU64 = AtomicU64::new(0);

/// A blocking FIFO with an optional capacity limit.
pub struct Queue<T> {
    id: u64,
    tx: flume::Sender<T>,
    rx: flume::Receiver<T>,
    closed: Arc<AtomicBool>,
}

impl<T> Clone for Queue<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            tx: self.tx.clone(),
            rx: self.rx.clone(),
            closed: self.closed.clone(),
        }
    }
}

impl<T> std::fmt::Debug for Queue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("id", &self.id)
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl<T> Queue<T> {
    /// Creates a queue holding at most `capacity` elements.
    #[must_use]
    pub fn bounded(capacity: usize) -> Self {
        let (tx, rx) = flume::bounded(capacity);
        Self::wrap(tx, rx)
    }

    /// Creates a queue without a capacity limit.
    #[must_use]
    pub fn unbounded() -> Self {
        let (tx, rx) = flume::unbounded();
        Self::wrap(tx, rx)
    }

    fn wrap(tx: flume::Sender<T>, rx: flume::Receiver<T>) -> Self {
        Self {
            id: NEXT_QUEUE_ID.fetch_add(1, Ordering::Relaxed),
            tx,
            rx,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Unique id of the underlying channel, stable across clones.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns `true` if `other` is a handle over the same underlying buffer.
    #[must_use]
    pub fn same_queue(&self, other: &Self) -> bool {
        self.id == other.id
    }

    /// Enqueues `value`, blocking for at most `timeout` while the queue is
    /// full.
    ///
    /// # Errors
    ///
    /// Returns [`SendError::Full`] if no slot freed up within `timeout`, and
    /// [`SendError::Closed`] if the queue has been closed.
    pub fn put(&self, value: T, timeout: Duration) -> Result<(), SendError<T>> {
        if self.is_closed() {
            return Err(SendError::Closed(value));
        }
        self.tx.send_timeout(value, timeout).map_err(|e| match e {
            flume::SendTimeoutError::Timeout(v) => {
                if self.is_closed() {
                    SendError::Closed(v)
                } else {
                    SendError::Full(v)
                }
            }
            flume::SendTimeoutError::Disconnected(v) => SendError::Closed(v),
        })
    }

    /// Dequeues an element, blocking for at most `timeout` while the queue is
    /// empty.
    ///
    /// Elements buffered before a close remain retrievable.
    ///
    /// # Errors
    ///
    /// Returns [`RecvError::Empty`] if nothing arrived within `timeout`, and
    /// [`RecvError::Closed`] if the queue is closed and drained.
    pub fn get(&self, timeout: Duration) -> Result<T, RecvError> {
        self.rx.recv_timeout(timeout).map_err(|e| match e {
            flume::RecvTimeoutError::Timeout => {
                if self.is_closed() {
                    RecvError::Closed
                } else {
                    RecvError::Empty
                }
            }
            flume::RecvTimeoutError::Disconnected => RecvError::Closed,
        })
    }

    /// Dequeues an element without blocking.
    ///
    /// # Errors
    ///
    /// Returns [`RecvError::Empty`] if the buffer holds nothing right now,
    /// and [`RecvError::Closed`] if the queue is closed and drained.
    pub fn try_get(&self) -> Result<T, RecvError> {
        self.rx.try_recv().map_err(|e| match e {
            flume::TryRecvError::Empty => {
                if self.is_closed() {
                    RecvError::Closed
                } else {
                    RecvError::Empty
                }
            }
            flume::TryRecvError::Disconnected => RecvError::Closed,
        })
    }

    /// Number of elements currently buffered.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// Returns `true` if nothing is buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Capacity limit, or `None` for an unbounded queue.
    #[must_use]
    pub fn capacity(&self) -> Option<usize> {
        self.tx.capacity()
    }

    /// Closes the queue: subsequent puts fail with [`SendError::Closed`].
    ///
    /// Closing is idempotent and observed by every clone of this handle.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Returns `true` once [`Queue::close`] has been called on any clone.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Removes and drops every currently buffered element, returning how many
    /// were discarded.
    pub fn drain(&self) -> usize {
        let mut discarded = 0;
        while self.rx.try_recv().is_ok() {
            discarded += 1;
        }
        discarded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    const SHORT: Duration = Duration::from_millis(20);

    #[test]
    fn test_basic_queue_operations() {
        let q = Queue::bounded(2);

        q.put(1, SHORT).expect("put 1");
        q.put(2, SHORT).expect("put 2");
        assert_eq!(q.len(), 2);
        assert_eq!(q.get(SHORT).expect("get 1"), 1);
        assert_eq!(q.get(SHORT).expect("get 2"), 2);

        // A timed-out get on an empty queue reports Empty.
        assert_eq!(q.get(SHORT), Err(RecvError::Empty));
    }

    #[test]
    fn test_queue_capacity() {
        let q = Queue::bounded(1);
        assert_eq!(q.capacity(), Some(1));

        q.put(1, SHORT).expect("first put fits");
        match q.put(2, SHORT) {
            Err(SendError::Full(2)) => (),
            other => panic!("expected Full, got {other:?}"),
        }
    }

    #[test]
    fn test_unbounded_queue() {
        let q = Queue::unbounded();
        assert_eq!(q.capacity(), None);
        for i in 0..1000 {
            q.put(i, SHORT).expect("unbounded put never times out");
        }
        assert_eq!(q.len(), 1000);
    }

    #[test]
    fn test_multiple_consumers_receive_each_value_once() {
        let q = Queue::bounded(4);
        let n = 100;

        let consumers: Vec<_> = (0..3)
            .map(|_| {
                let q = q.clone();
                thread::spawn(move || {
                    let mut got = Vec::new();
                    while let Ok(v) = q.get(Duration::from_millis(200)) {
                        got.push(v);
                    }
                    got
                })
            })
            .collect();

        for i in 0..n {
            q.put(i, Duration::from_secs(1)).expect("producer put");
        }

        let mut all: Vec<i32> = consumers
            .into_iter()
            .flat_map(|h| h.join().expect("consumer thread"))
            .collect();
        all.sort_unstable();
        assert_eq!(all, (0..n).collect::<Vec<_>>());
    }

    #[test]
    fn test_blocked_put_resumes_after_get() {
        let q = Queue::bounded(1);
        q.put(1, SHORT).expect("fill the queue");

        let producer = {
            let q = q.clone();
            thread::spawn(move || q.put(2, Duration::from_secs(2)))
        };

        thread::sleep(Duration::from_millis(50));
        assert_eq!(q.get(SHORT).expect("unblock the producer"), 1);

        producer
            .join()
            .expect("producer thread")
            .expect("blocked put completes once a slot frees up");
        assert_eq!(q.get(Duration::from_millis(200)).expect("second value"), 2);
    }

    #[test]
    fn test_close_refuses_new_puts_but_keeps_buffered_elements() {
        let q = Queue::bounded(2);
        q.put(1, SHORT).expect("put before close");
        q.close();

        match q.put(2, SHORT) {
            Err(SendError::Closed(2)) => (),
            other => panic!("expected Closed, got {other:?}"),
        }

        // The buffered element survives the close, then the queue reports
        // Closed instead of Empty.
        assert_eq!(q.try_get().expect("drain buffered element"), 1);
        assert_eq!(q.try_get(), Err(RecvError::Closed));
        assert_eq!(q.get(SHORT), Err(RecvError::Closed));
    }

    #[test]
    fn test_close_is_shared_across_clones() {
        let q = Queue::<u8>::bounded(1);
        let clone = q.clone();
        clone.close();
        assert!(q.is_closed());
    }

    #[test]
    fn test_drain_discards_everything() {
        let q = Queue::unbounded();
        for i in 0..5 {
            q.put(i, SHORT).expect("put");
        }
        assert_eq!(q.drain(), 5);
        assert!(q.is_empty());
    }

    #[test]
    fn test_clone_shares_the_same_buffer() {
        let a = Queue::bounded(1);
        let b = a.clone();
        let c = Queue::<i32>::bounded(1);

        assert!(a.same_queue(&b));
        assert!(!a.same_queue(&c));

        a.put(7, SHORT).expect("put through one handle");
        assert_eq!(b.get(SHORT).expect("get through the other"), 7);
    }

    #[test]
    fn test_get_timeout_is_bounded() {
        let q = Queue::<u8>::bounded(1);
        let start = Instant::now();
        assert_eq!(q.get(Duration::from_millis(50)), Err(RecvError::Empty));
        // Give the scheduler plenty of slack, but the wait must not be
        // unbounded.
        assert!(start.elapsed() < Duration::from_secs(2));
    }
}
