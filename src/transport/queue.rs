//! Bounded per-link outbound queue with drop-oldest backpressure (§9
//! "Back-pressure on outbound sends is handled by bounded per-link queues
//! with drop-oldest on overflow").

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::Notify;

/// A bounded FIFO that drops its oldest entry rather than blocking or
/// rejecting when full. Used to hold outbound frames per link so one slow
/// or stalled peer can't back up sends to every other peer.
pub struct BoundedDropOldestQueue<T> {
    capacity: usize,
    items: Mutex<VecDeque<T>>,
    notify: Notify,
}

impl<T> BoundedDropOldestQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
        }
    }

    /// Push `item`, dropping the oldest queued item if already at capacity.
    /// Returns the dropped item, if any.
    pub fn push(&self, item: T) -> Option<T> {
        let mut items = self.items.lock();
        let dropped = if items.len() >= self.capacity {
            items.pop_front()
        } else {
            None
        };
        items.push_back(item);
        drop(items);
        self.notify.notify_one();
        dropped
    }

    pub fn pop(&self) -> Option<T> {
        self.items.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait for and pop the next item, parking the caller rather than
    /// spinning when the queue is empty. The `notified()` future is created
    /// before the emptiness check so a `push` landing between the check and
    /// the wait can never be missed (the classic lost-wakeup race).
    pub async fn recv(&self) -> T {
        loop {
            let notified = self.notify.notified();
            if let Some(item) = self.pop() {
                return item;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overflow_drops_the_oldest_entry() {
        let queue = BoundedDropOldestQueue::new(2);
        assert!(queue.push(1).is_none());
        assert!(queue.push(2).is_none());
        assert_eq!(queue.push(3), Some(1));
        assert_eq!(queue.pop(), Some(2));
        assert_eq!(queue.pop(), Some(3));
        assert!(queue.pop().is_none());
    }
}
