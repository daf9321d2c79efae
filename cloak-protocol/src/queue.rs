//! Bounded blocking queue with interrupt
//!
//! Hands frames from upper-layer writers to the device-writer worker.
//! `interrupt` is the teardown signal: it is idempotent, wakes every blocked
//! producer and consumer, and moves the queue into a terminal drained state
//! in which `put` refuses items and `get` returns `None` forever.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::Semaphore;

/// A bounded producer/consumer queue whose blocking operations can be
/// released en masse by [`interrupt`](Self::interrupt).
#[derive(Debug)]
pub struct BoundedQueue<T> {
    items: Mutex<VecDeque<T>>,
    /// Permits for free slots; producers acquire one per put
    space: Semaphore,
    /// Permits for queued items; consumers acquire one per get
    fill: Semaphore,
}

impl<T> BoundedQueue<T> {
    /// Create a queue holding at most `capacity` items.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be positive");
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            space: Semaphore::new(capacity),
            fill: Semaphore::new(0),
        }
    }

    /// Enqueue `item`, waiting while the queue is full.
    ///
    /// After [`interrupt`](Self::interrupt) the item is handed back through
    /// `Err` immediately so the caller can recycle it.
    pub async fn put(&self, item: T) -> Result<(), T> {
        match self.space.acquire().await {
            Ok(permit) => {
                permit.forget();
                self.items
                    .lock()
                    .expect("queue lock poisoned")
                    .push_back(item);
                self.fill.add_permits(1);
                Ok(())
            }
            Err(_) => Err(item),
        }
    }

    /// Dequeue one item, waiting while the queue is empty.
    ///
    /// Returns `None` once the queue has been interrupted; items still queued
    /// at that point are discarded, not delivered.
    pub async fn get(&self) -> Option<T> {
        match self.fill.acquire().await {
            Ok(permit) => {
                permit.forget();
                // An interrupt may have drained the deque between the permit
                // grant and this lock; that read maps to the null sentinel.
                let item = self.items.lock().expect("queue lock poisoned").pop_front();
                if item.is_some() {
                    self.space.add_permits(1);
                }
                item
            }
            Err(_) => None,
        }
    }

    /// Interrupt the queue: idempotent, wakes all blocked producers and
    /// consumers, and makes every future operation return immediately.
    pub fn interrupt(&self) {
        self.space.close();
        self.fill.close();
        self.items.lock().expect("queue lock poisoned").clear();
    }

    /// Whether the queue has been interrupted
    pub fn is_interrupted(&self) -> bool {
        self.space.is_closed()
    }

    /// Number of items currently queued
    pub fn len(&self) -> usize {
        self.items.lock().expect("queue lock poisoned").len()
    }

    /// Whether no items are queued
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
