//! A single-threaded event loop which receives completions from worker
//! threads.
//!
//! Worker threads hold a [`Poster`] and move finished items onto the loop's
//! completion queue. The loop thread owns the [`EventLoop`] and, once per
//! iteration, drains the items queued so far and hands each one to a
//! handler exactly once.
//!
//! The loop keeps a count of outstanding work. Submitters call
//! [`EventLoop::ref_work`] when they hand an item to a worker, and the
//! handler calls [`EventLoop::unref_work`] once the item has been
//! delivered, so [`EventLoop::run`] does not return while work is still in
//! flight.
//!
//! # Modules
//! - `park`: how long an iteration may block waiting for completions.
//! - `queue`: the thread-safe completion queue and its producer handle.
//! - `wakeup`: the cross-thread wakeup used while the loop is parked.
#![cfg(unix)]
#![deny(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    clippy::missing_safety_doc
)]
use std::cell::Cell;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::Rc;
use std::sync::Arc;

use log::trace;

mod park;
mod queue;
mod wakeup;

pub use park::ParkMode;
pub use queue::{Drain, Poster};

const LOG: &str = "serial_loop";

/// The loop-thread side of a completion queue.
///
/// [`EventLoop`] is a cheap reference-counted handle; clones refer to the
/// same loop. It cannot be sent to other threads, use [`EventLoop::poster`]
/// to obtain a producer handle for workers.
pub struct EventLoop<T> {
    inner: Rc<Inner<T>>,
}

struct Inner<T> {
    shared: Arc<queue::Shared<T>>,
    pending: Cell<usize>,
}

impl<T> Clone for EventLoop<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T> std::fmt::Debug for EventLoop<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("pending", &self.inner.pending.get())
            .finish()
    }
}

impl<T: Send + 'static> EventLoop<T> {
    /// Create a new [`EventLoop`] with an empty completion queue.
    pub fn new() -> io::Result<Self> {
        let wakeup = wakeup::Wakeup::new()?;
        Ok(Self {
            inner: Rc::new(Inner {
                shared: Arc::new(queue::Shared::new(wakeup)),
                pending: Cell::new(0),
            }),
        })
    }

    /// Returns a producer handle which worker threads use to post completions.
    pub fn poster(&self) -> Poster<T> {
        Poster::new(Arc::clone(&self.inner.shared))
    }

    /// Record one more outstanding unit of work.
    pub fn ref_work(&self) {
        self.inner.pending.set(self.inner.pending.get() + 1);
    }

    /// Record that one outstanding unit of work has been delivered.
    ///
    /// ### Panics
    /// Panics if there is no outstanding work, which indicates a double delivery.
    #[track_caller]
    pub fn unref_work(&self) {
        let pending = self.inner.pending.get();
        assert!(pending > 0, "unref_work called without outstanding work");
        self.inner.pending.set(pending - 1);
    }

    /// Returns the number of outstanding units of work.
    pub fn pending_work(&self) -> usize {
        self.inner.pending.get()
    }

    /// Returns true if any work is outstanding.
    pub fn has_pending_work(&self) -> bool {
        self.pending_work() > 0
    }

    /// Returns true if completions are waiting to be drained.
    pub fn has_queued(&self) -> bool {
        !self.inner.shared.is_empty()
    }

    /// Block until a completion is posted, respecting `mode`.
    ///
    /// Returns immediately if completions are already queued.
    pub fn park(&self, mode: ParkMode) -> io::Result<()> {
        if self.has_queued() {
            return Ok(());
        }
        self.inner.shared.wakeup().wait(mode)
    }

    /// Take every completion queued so far as one finite batch.
    pub fn drain(&self) -> Drain<T> {
        let batch = self.inner.shared.take_batch();
        trace!(target: LOG, "drain.batch {}", batch.len());
        Drain::new(batch)
    }

    /// Run a single loop iteration.
    ///
    /// Parks until the next completion if work is outstanding, then hands
    /// each item of one drained batch to `handler`. Returns the number of
    /// items handled.
    pub fn run_once<F>(&self, mut handler: F) -> io::Result<usize>
    where
        F: FnMut(T),
    {
        let mode = if self.has_pending_work() {
            ParkMode::NextCompletion
        } else {
            ParkMode::NoPark
        };
        self.park(mode)?;
        let mut handled = 0;
        for item in self.drain() {
            handler(item);
            handled += 1;
        }
        Ok(handled)
    }

    /// Run iterations until no outstanding work remains.
    pub fn run<F>(&self, mut handler: F) -> io::Result<()>
    where
        F: FnMut(T),
    {
        loop {
            self.run_once(&mut handler)?;
            if !self.has_pending_work() && self.inner.shared.is_empty() {
                return Ok(());
            }
        }
    }
}

impl<T> AsRawFd for EventLoop<T> {
    /// The wakeup descriptor, readable whenever a worker posted while the loop was parked.
    fn as_raw_fd(&self) -> RawFd {
        self.inner.shared.wakeup().as_raw_fd()
    }
}
