//! Moves finished requests from worker threads back to the loop thread.
//!
//! Callbacks are not `Send`, so they never leave the loop thread. They wait
//! in a slot table keyed by [`Token`] while the request itself, which only
//! carries the token, travels to a worker and back.
use std::cell::RefCell;
use std::collections::HashSet;
use std::fmt;

use log::{trace, warn};
use serial_loop::{EventLoop, Poster};

use crate::device::{self, DeviceHandle};
use crate::error::Error;
use crate::request::{Completion, Output, Request, Token};

const LOG: &str = "serial_native::relay";

/// Invoked on the loop thread with the outcome of an asynchronous request.
pub type Callback = Box<dyn FnOnce(Completion)>;

/// Pending callbacks indexed by token. Freed slots are reused.
#[derive(Default)]
pub(crate) struct Slots {
    entries: Vec<Option<Callback>>,
    free: Vec<usize>,
}

impl fmt::Debug for Slots {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slots")
            .field("pending", &self.len())
            .field("capacity", &self.entries.len())
            .finish()
    }
}

impl Slots {
    pub(crate) fn insert(&mut self, callback: Callback) -> Token {
        match self.free.pop() {
            Some(idx) => {
                debug_assert!(self.entries[idx].is_none());
                self.entries[idx] = Some(callback);
                Token(idx)
            }
            None => {
                self.entries.push(Some(callback));
                Token(self.entries.len() - 1)
            }
        }
    }

    pub(crate) fn remove(&mut self, token: Token) -> Option<Callback> {
        let callback = self.entries.get_mut(token.0)?.take()?;
        self.free.push(token.0);
        Some(callback)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len() - self.free.len()
    }
}

/// Handles opened through one dispatcher and not yet closed.
///
/// A descriptor number is reused by the OS as soon as it is closed, so a
/// stale handle is only detectable by remembering which ones are live.
#[derive(Debug, Default)]
pub(crate) struct Handles {
    open: HashSet<DeviceHandle>,
}

impl Handles {
    pub(crate) fn track(&mut self, handle: DeviceHandle) {
        if !self.open.insert(handle) {
            warn!(target: LOG, "handles.reopened {:?}", handle);
        }
    }

    pub(crate) fn check(&self, handle: DeviceHandle) -> Result<(), Error> {
        if self.open.contains(&handle) {
            return Ok(());
        }
        Err(Error::bad_handle())
    }

    /// Forget `handle`. Any later use of it fails, even if the close itself does.
    pub(crate) fn release(&mut self, handle: DeviceHandle) -> Result<(), Error> {
        if self.open.remove(&handle) {
            return Ok(());
        }
        Err(Error::bad_handle())
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.open.len()
    }
}

/// Worker side: run the device operation, then hand the request to the loop.
///
/// The post is the last thing the worker does with the request. Ownership
/// moves into the queue, so the worker cannot touch it afterwards.
pub(crate) fn execute(mut request: Request, poster: &Poster<Request>) {
    trace!(target: LOG, "execute.start {:?}", request.kind());
    request.run();
    poster.post(request);
}

/// Loop side: invoke the callback for one finished request, exactly once.
pub(crate) fn deliver(
    event_loop: &EventLoop<Request>,
    slots: &RefCell<Slots>,
    handles: &RefCell<Handles>,
    request: Request,
) {
    let (token, completion) = request.into_parts();
    let Some(token) = token else {
        warn!(target: LOG, "deliver.untracked {:?}", completion.kind());
        return;
    };
    // Release the borrow before running user code, which may submit again.
    let callback = slots.borrow_mut().remove(token);
    event_loop.unref_work();

    match callback {
        Some(callback) => {
            trace!(target: LOG, "deliver.callback {:?} {:?}", token, completion.kind());
            // Usable from inside the callback.
            if let Some(handle) = completion.handle() {
                handles.borrow_mut().track(handle);
            }
            callback(completion);
        }
        None => {
            warn!(target: LOG, "deliver.missing_slot {:?}", token);
            // Nobody will ever see this handle, so it must not leak.
            if let Ok(Output::Opened(handle)) = completion.into_result() {
                if let Err(err) = device::close(handle) {
                    warn!(target: LOG, "deliver.close_failed {:?}: {}", handle, err);
                }
            }
        }
    }
}
