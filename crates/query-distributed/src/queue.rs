//! Capacity-bounded blocking queue
//!
//! The only synchronization boundary between a network context, which
//! produces decoded messages, and the thread that drives a fragment. A full
//! queue blocks the producer; nothing is ever dropped or reordered.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;

/// Default number of slots in a receive queue
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

struct QueueState<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Multi-producer, multi-consumer blocking queue with a fixed capacity
pub struct BoundedQueue<T> {
    state: Mutex<QueueState<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
}

impl<T> BoundedQueue<T> {
    /// Create a queue holding at most `capacity` items (at least one)
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
        }
    }

    /// Append an item, blocking while the queue is full.
    ///
    /// Returns the item back only if the queue has been closed.
    pub fn put(&self, item: T) -> Result<(), T> {
        let mut state = self.state.lock();
        while state.items.len() >= self.capacity && !state.closed {
            self.not_full.wait(&mut state);
        }
        if state.closed {
            return Err(item);
        }
        state.items.push_back(item);
        drop(state);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Remove the oldest item, blocking while the queue is empty.
    ///
    /// Returns `None` once the queue is closed and drained.
    pub fn take(&self) -> Option<T> {
        let mut state = self.state.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                drop(state);
                self.not_full.notify_one();
                return Some(item);
            }
            if state.closed {
                return None;
            }
            self.not_empty.wait(&mut state);
        }
    }

    /// Remove the oldest item without blocking
    pub fn try_take(&self) -> Option<T> {
        let item = self.state.lock().items.pop_front();
        if item.is_some() {
            self.not_full.notify_one();
        }
        item
    }

    /// Close the queue and wake every blocked producer and consumer.
    /// Used only when tearing a channel down.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_fifo_order() {
        let queue = BoundedQueue::with_capacity(4);
        for i in 0..4 {
            queue.put(i).unwrap();
        }
        assert_eq!(queue.len(), 4);
        for i in 0..4 {
            assert_eq!(queue.take(), Some(i));
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn test_full_queue_blocks_producer() {
        let queue = Arc::new(BoundedQueue::with_capacity(2));
        queue.put(1).unwrap();
        queue.put(2).unwrap();

        let done = Arc::new(AtomicBool::new(false));
        let producer = {
            let queue = queue.clone();
            let done = done.clone();
            thread::spawn(move || {
                queue.put(3).unwrap();
                done.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!done.load(Ordering::SeqCst));
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.take(), Some(1));
        producer.join().unwrap();
        assert!(done.load(Ordering::SeqCst));
        assert_eq!(queue.take(), Some(2));
        assert_eq!(queue.take(), Some(3));
    }

    #[test]
    fn test_empty_queue_blocks_consumer() {
        let queue = Arc::new(BoundedQueue::with_capacity(1));
        let consumer = {
            let queue = queue.clone();
            thread::spawn(move || queue.take())
        };
        thread::sleep(Duration::from_millis(20));
        queue.put("x").unwrap();
        assert_eq!(consumer.join().unwrap(), Some("x"));
    }

    #[test]
    fn test_many_producers_keep_per_producer_order() {
        let queue = Arc::new(BoundedQueue::with_capacity(8));
        let producers: Vec<_> = (0..4)
            .map(|p| {
                let queue = queue.clone();
                thread::spawn(move || {
                    for i in 0..500 {
                        queue.put((p, i)).unwrap();
                    }
                })
            })
            .collect();

        let mut last = [-1i32; 4];
        for _ in 0..2000 {
            let (p, i) = queue.take().unwrap();
            assert!(i > last[p]);
            last[p] = i;
        }
        for producer in producers {
            producer.join().unwrap();
        }
        assert_eq!(last, [499; 4]);
    }

    #[test]
    fn test_close_wakes_blocked_producer() {
        let queue = Arc::new(BoundedQueue::with_capacity(1));
        queue.put(1).unwrap();
        let producer = {
            let queue = queue.clone();
            thread::spawn(move || queue.put(2))
        };
        thread::sleep(Duration::from_millis(20));
        queue.close();
        assert_eq!(producer.join().unwrap(), Err(2));
        // Remaining items still drain after close.
        assert_eq!(queue.take(), Some(1));
        assert_eq!(queue.take(), None);
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let queue: BoundedQueue<u8> = BoundedQueue::with_capacity(0);
        assert_eq!(queue.capacity(), 1);
    }
}
