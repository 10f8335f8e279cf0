//! Bounded FIFO feeding the child's stdin.
//!
//! Unlike a plain `mpsc` channel the queue can evict its oldest entry,
//! which the `drop-oldest` overflow policy needs.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

pub use pipebridge_core::OverflowPolicy;

/// Outcome of a successful push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pushed {
    /// The item was appended.
    Queued,
    /// The item was appended after evicting the oldest queued item.
    DroppedOldest,
}

/// Why a push did not enqueue anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("queue is full")]
    Full,
    #[error("queue is closed")]
    Closed,
}

struct State<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Bounded multi-producer, single-consumer FIFO with an overflow policy.
pub struct InputQueue<T> {
    state: Mutex<State<T>>,
    capacity: usize,
    policy: OverflowPolicy,
    item_ready: Notify,
    space_ready: Notify,
}

impl<T> InputQueue<T> {
    /// Create a queue holding at most `capacity` items (minimum 1).
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(State {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            capacity,
            policy,
            item_ready: Notify::new(),
            space_ready: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        // The critical sections never panic; recover the data if one ever did.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append an item, applying the overflow policy when full.
    ///
    /// Only the `Block` policy ever suspends.
    pub async fn push(&self, item: T) -> Result<Pushed, QueueError> {
        let mut item = Some(item);
        loop {
            let space = self.space_ready.notified();
            tokio::pin!(space);
            space.as_mut().enable();

            {
                let mut state = self.lock();
                if state.closed {
                    return Err(QueueError::Closed);
                }
                let outcome = if state.items.len() < self.capacity {
                    Some(Pushed::Queued)
                } else {
                    match self.policy {
                        OverflowPolicy::Block => None,
                        OverflowPolicy::Reject => return Err(QueueError::Full),
                        OverflowPolicy::DropOldest => {
                            state.items.pop_front();
                            Some(Pushed::DroppedOldest)
                        }
                    }
                };
                if let Some(outcome) = outcome
                    && let Some(item) = item.take()
                {
                    state.items.push_back(item);
                    drop(state);
                    self.item_ready.notify_one();
                    return Ok(outcome);
                }
            }

            space.await;
        }
    }

    /// Take the oldest item, waiting for one if the queue is empty.
    ///
    /// Returns `None` once the queue is closed and fully drained.
    pub async fn pop(&self) -> Option<T> {
        loop {
            let ready = self.item_ready.notified();
            tokio::pin!(ready);
            ready.as_mut().enable();

            {
                let mut state = self.lock();
                if let Some(item) = state.items.pop_front() {
                    drop(state);
                    self.space_ready.notify_one();
                    return Some(item);
                }
                if state.closed {
                    return None;
                }
            }

            ready.await;
        }
    }

    /// Refuse further pushes. Items already queued can still be popped.
    pub fn close(&self) {
        let mut state = self.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        drop(state);
        self.item_ready.notify_waiters();
        self.space_ready.notify_waiters();
    }

    /// Close and discard everything still queued. Returns the number discarded.
    pub fn close_and_clear(&self) -> usize {
        let mut state = self.lock();
        state.closed = true;
        let discarded = state.items.len();
        state.items.clear();
        drop(state);
        self.item_ready.notify_waiters();
        self.space_ready.notify_waiters();
        discarded
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub const fn capacity(&self) -> usize {
        self.capacity
    }
}
