//! The completion queue shared between worker threads and the loop thread.
//!
//! This is the one structure in the system mutated from more than one
//! thread. Producers push under the lock and then wake the loop; the loop
//! takes the whole queue in one step, which both bounds the batch it will
//! process and establishes the happens-before edge for everything a
//! producer wrote into an item before posting it.
use std::collections::{vec_deque, VecDeque};
use std::sync::Arc;
use std::{fmt, mem};

use log::trace;
use parking_lot::Mutex;

use crate::wakeup::Wakeup;

const LOG: &str = "serial_loop::queue";

pub(crate) struct Shared<T> {
    queue: Mutex<VecDeque<T>>,
    wakeup: Wakeup,
}

impl<T> Shared<T> {
    pub(crate) fn new(wakeup: Wakeup) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(64)),
            wakeup,
        }
    }

    pub(crate) fn push(&self, item: T) {
        let depth = {
            let mut queue = self.queue.lock();
            queue.push_back(item);
            queue.len()
        };
        trace!(target: LOG, "post.depth {}", depth);
        self.wakeup.signal();
    }

    pub(crate) fn take_batch(&self) -> VecDeque<T> {
        let mut queue = self.queue.lock();
        if queue.is_empty() {
            return VecDeque::new();
        }
        mem::replace(&mut *queue, VecDeque::with_capacity(64))
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    pub(crate) fn wakeup(&self) -> &Wakeup {
        &self.wakeup
    }
}

/// A thread-safe producer handle for an [`EventLoop`]'s completion queue.
///
/// Posting an item moves it into the queue. The poster keeps no reference
/// to it afterwards; the loop thread receives sole ownership when it drains
/// the batch containing the item.
///
/// [`EventLoop`]: crate::EventLoop
pub struct Poster<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Poster<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> fmt::Debug for Poster<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Poster").finish()
    }
}

impl<T: Send> Poster<T> {
    pub(crate) fn new(shared: Arc<Shared<T>>) -> Self {
        Self { shared }
    }

    /// Post a completed item to the owning loop and wake it if it is parked.
    pub fn post(&self, item: T) {
        self.shared.push(item);
    }
}

/// A finite batch of completions taken from the queue in one step.
///
/// Items posted while a batch is being processed land in the next batch.
pub struct Drain<T> {
    inner: vec_deque::IntoIter<T>,
}

impl<T> Drain<T> {
    pub(crate) fn new(batch: VecDeque<T>) -> Self {
        Self {
            inner: batch.into_iter(),
        }
    }
}

impl<T> fmt::Debug for Drain<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Drain")
            .field("remaining", &self.inner.len())
            .finish()
    }
}

impl<T> Iterator for Drain<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.inner.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl<T> ExactSizeIterator for Drain<T> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_is_fifo() {
        let shared = Shared::new(Wakeup::new().unwrap());
        for i in 0..10 {
            shared.push(i);
        }
        let batch: Vec<_> = Drain::new(shared.take_batch()).collect();
        assert_eq!(batch, (0..10).collect::<Vec<_>>());
        assert!(shared.is_empty());
    }

    #[test]
    fn push_during_drain_lands_in_next_batch() {
        let shared = Shared::new(Wakeup::new().unwrap());
        shared.push(1);
        shared.push(2);
        let mut drain = Drain::new(shared.take_batch());
        assert_eq!(drain.next(), Some(1));
        shared.push(3);
        assert_eq!(drain.next(), Some(2));
        assert_eq!(drain.next(), None);
        let next: Vec<_> = Drain::new(shared.take_batch()).collect();
        assert_eq!(next, vec![3]);
    }

    #[test]
    fn panicking_producer_leaves_queue_usable() {
        let shared = Arc::new(Shared::new(Wakeup::new().unwrap()));
        let remote = Arc::clone(&shared);
        let producer = std::thread::spawn(move || {
            remote.push(1);
            panic!("producer failed after posting");
        });
        assert!(producer.join().is_err());

        shared.push(2);
        let batch: Vec<_> = Drain::new(shared.take_batch()).collect();
        assert_eq!(batch, vec![1, 2]);
    }
}
