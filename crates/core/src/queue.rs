use crossbeam_queue::ArrayQueue;
use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

/// Strict-FIFO queue shared between threads.
///
/// This is the ordering ledger of the pipeline: submitted buffer indices and
/// their pending completion tasks are pushed here in submission order and
/// popped in the same order on the dequeue thread. All operations take one
/// lock and never block beyond it; `pop` on an empty queue returns `None`.
///
/// # Example
/// ```rust
/// use argus_core::prelude::FifoQueue;
///
/// let q = FifoQueue::new();
/// q.push(1u32);
/// q.push(2);
/// assert_eq!(q.front(), Some(1));
/// assert_eq!(q.pop(), Some(1));
/// assert_eq!(q.pop(), Some(2));
/// assert_eq!(q.pop(), None);
/// ```
pub struct FifoQueue<T> {
    inner: parking_lot::Mutex<VecDeque<T>>,
}

impl<T> Default for FifoQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> FifoQueue<T> {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self {
            inner: parking_lot::Mutex::new(VecDeque::new()),
        }
    }

    /// Append an item at the tail. Unbounded; owners enforce caps externally.
    pub fn push(&self, item: T) {
        self.inner.lock().push_back(item);
    }

    /// Remove and return the head, or `None` when empty. Never blocks.
    pub fn pop(&self) -> Option<T> {
        self.inner.lock().pop_front()
    }

    /// Remove and return the tail. Used to take back the most recent push
    /// when a follow-up step fails.
    pub fn pop_back(&self) -> Option<T> {
        self.inner.lock().pop_back()
    }

    /// Whether the queue currently holds no items.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Drop all queued items.
    pub fn clear(&self) {
        self.inner.lock().clear();
    }
}

impl<T: Clone> FifoQueue<T> {
    /// Peek at the head without removing it.
    pub fn front(&self) -> Option<T> {
        self.inner.lock().front().cloned()
    }
}

/// Result of attempting to enqueue on a bounded queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Value was accepted.
    Ok,
    /// Queue is full; the item was dropped (admission control, not an error).
    Full,
    /// Queue is closed.
    Closed,
}

/// Result of attempting to dequeue.
#[derive(Debug)]
pub enum RecvOutcome<T> {
    /// Received value.
    Data(T),
    /// Queue has been closed and drained.
    Closed,
    /// Queue currently empty; try again later.
    Empty,
}

struct QueueInner<T> {
    queue: ArrayQueue<T>,
    closed: AtomicBool,
}

/// Bounded sender handle.
///
/// `send` never blocks: when the consumer stalls and the queue fills, the
/// newest item is rejected with [`SendOutcome::Full`] so the producer keeps
/// its cadence. This is the explicit overload policy for frame handoff.
#[derive(Clone)]
pub struct BoundedTx<T> {
    inner: Arc<QueueInner<T>>,
}

impl<T> BoundedTx<T> {
    /// Attempt to send without blocking.
    pub fn send(&self, value: T) -> SendOutcome {
        if self.inner.closed.load(Ordering::Acquire) {
            return SendOutcome::Closed;
        }
        self.inner
            .queue
            .push(value)
            .map(|_| SendOutcome::Ok)
            .unwrap_or(SendOutcome::Full)
    }

    /// Close the queue to further sends.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
    }
}

/// Bounded receiver handle.
#[derive(Clone)]
pub struct BoundedRx<T> {
    inner: Arc<QueueInner<T>>,
}

impl<T> BoundedRx<T> {
    /// Attempt to receive without blocking.
    pub fn recv(&self) -> RecvOutcome<T> {
        match self.inner.queue.pop() {
            Some(value) => RecvOutcome::Data(value),
            None => {
                if self.inner.closed.load(Ordering::Acquire) {
                    RecvOutcome::Closed
                } else {
                    RecvOutcome::Empty
                }
            }
        }
    }

    /// Number of items currently queued.
    pub fn len(&self) -> usize {
        self.inner.queue.len()
    }

    /// Whether the queue is currently empty.
    pub fn is_empty(&self) -> bool {
        self.inner.queue.is_empty()
    }

    /// Mark the queue as closed; senders will see `Closed` and exit.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
    }
}

/// Create a bounded queue with the given capacity.
///
/// # Example
/// ```rust
/// use argus_core::prelude::{RecvOutcome, SendOutcome, bounded};
///
/// let (tx, rx) = bounded::<u8>(1);
/// assert_eq!(tx.send(1), SendOutcome::Ok);
/// assert_eq!(tx.send(2), SendOutcome::Full);
/// assert!(matches!(rx.recv(), RecvOutcome::Data(1)));
/// ```
pub fn bounded<T>(capacity: usize) -> (BoundedTx<T>, BoundedRx<T>) {
    let inner = Arc::new(QueueInner {
        queue: ArrayQueue::new(capacity),
        closed: AtomicBool::new(false),
    });
    (
        BoundedTx {
            inner: inner.clone(),
        },
        BoundedRx { inner },
    )
}

struct NewestInner<T> {
    slot: parking_lot::RwLock<Option<T>>,
    closed: AtomicBool,
}

/// Sender for the newest-value slot.
#[derive(Clone)]
pub struct NewestTx<T> {
    inner: Arc<NewestInner<T>>,
}

impl<T: Clone> NewestTx<T> {
    /// Overwrite with the latest value.
    pub fn send(&self, value: T) -> SendOutcome {
        if self.inner.closed.load(Ordering::Acquire) {
            return SendOutcome::Closed;
        }
        *self.inner.slot.write() = Some(value);
        SendOutcome::Ok
    }

    /// Close the slot.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
    }
}

/// Receiver for the newest-value slot.
#[derive(Clone)]
pub struct NewestRx<T> {
    inner: Arc<NewestInner<T>>,
}

impl<T: Clone> NewestRx<T> {
    /// Get the latest value if one has been published.
    pub fn recv(&self) -> RecvOutcome<T> {
        let read = self.inner.slot.read();
        if let Some(value) = read.as_ref() {
            RecvOutcome::Data(value.clone())
        } else if self.inner.closed.load(Ordering::Acquire) {
            RecvOutcome::Closed
        } else {
            RecvOutcome::Empty
        }
    }
}

/// Single-slot latest-value channel without backpressure.
///
/// Backs `CaptureSource::frame()`: readers always observe the most recent
/// fully captured frame, never a stale backlog.
pub fn newest<T: Clone>() -> (NewestTx<T>, NewestRx<T>) {
    let inner = Arc::new(NewestInner {
        slot: parking_lot::RwLock::new(None),
        closed: AtomicBool::new(false),
    });
    (
        NewestTx {
            inner: inner.clone(),
        },
        NewestRx { inner },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_round_trip_preserves_order() {
        let q = FifoQueue::new();
        for i in 0..16u32 {
            q.push(i);
        }
        assert_eq!(q.len(), 16);
        for i in 0..16u32 {
            assert_eq!(q.pop(), Some(i));
        }
        assert_eq!(q.pop(), None);
        assert!(q.is_empty());
    }

    #[test]
    fn fifo_front_does_not_consume() {
        let q = FifoQueue::new();
        q.push("a");
        assert_eq!(q.front(), Some("a"));
        assert_eq!(q.len(), 1);
        assert_eq!(q.pop(), Some("a"));
    }

    #[test]
    fn fifo_clear_empties() {
        let q = FifoQueue::new();
        q.push(1);
        q.push(2);
        q.clear();
        assert!(q.is_empty());
        assert_eq!(q.pop(), None::<i32>);
    }

    #[test]
    fn bounded_rejects_overflow_without_blocking() {
        let (tx, rx) = bounded::<u32>(8);
        for i in 0..8 {
            assert_eq!(tx.send(i), SendOutcome::Ok);
        }
        // 9th push while the consumer stalls: dropped, queue stays at 8.
        assert_eq!(tx.send(8), SendOutcome::Full);
        assert_eq!(rx.len(), 8);
        let mut seen = Vec::new();
        while let RecvOutcome::Data(v) = rx.recv() {
            seen.push(v);
        }
        assert_eq!(seen, (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn bounded_close_is_observed_by_both_ends() {
        let (tx, rx) = bounded::<u32>(2);
        tx.close();
        assert_eq!(tx.send(1), SendOutcome::Closed);
        assert!(matches!(rx.recv(), RecvOutcome::Closed));
    }

    #[test]
    fn newest_overwrites() {
        let (tx, rx) = newest::<u32>();
        assert!(matches!(rx.recv(), RecvOutcome::Empty));
        tx.send(1);
        tx.send(2);
        assert!(matches!(rx.recv(), RecvOutcome::Data(2)));
    }
}
