//! Chooses between running a request inline and handing it to a worker.
use std::cell::RefCell;
use std::fmt;
use std::io;
use std::path::Path;
use std::rc::Rc;

use bytes::BytesMut;
use log::{debug, trace};
use serial_loop::EventLoop;

use crate::device::{self, DeviceHandle, LineConfig};
use crate::error::Error;
use crate::pool::Pool;
use crate::relay::{self, Callback, Handles, Slots};
use crate::request::{Completion, Kind, Op, Request, Token};

const LOG: &str = "serial_native::dispatch";

/// What a submission produced.
#[derive(Debug)]
pub enum Dispatch {
    /// The request ran on the calling thread. Holds the final outcome.
    Complete(Completion),
    /// The request was handed to a worker. Its callback runs on a later
    /// loop iteration.
    Pending(Token),
}

impl Dispatch {
    /// Returns the completion of a synchronous request.
    pub fn into_completion(self) -> Option<Completion> {
        match self {
            Dispatch::Complete(completion) => Some(completion),
            Dispatch::Pending(_) => None,
        }
    }

    /// Returns true if the request is still in flight.
    pub fn is_pending(&self) -> bool {
        matches!(self, Dispatch::Pending(_))
    }
}

/// Submits device operations on behalf of one event loop.
///
/// Every operation takes an optional callback. Without one the operation
/// runs on the calling thread, blocking it for the duration of the syscall,
/// and the outcome is returned as [`Dispatch::Complete`]. With one the
/// operation runs on a pool thread and the call returns
/// [`Dispatch::Pending`]; the callback is invoked exactly once from
/// [`Dispatcher::run_once`] or [`Dispatcher::run`] on the loop thread.
///
/// Argument errors are returned as `Err` in both modes, before any
/// syscall and before the callback is queued. That includes using a handle
/// this dispatcher did not open, or one already submitted for closing,
/// which fails with [`BadHandle`](crate::ErrorKind::BadHandle).
///
/// ```no_run
/// use serial_native::{Dispatcher, EventLoop, LineConfig};
///
/// let event_loop = EventLoop::new()?;
/// let dispatcher = Dispatcher::new(&event_loop);
///
/// let opened = dispatcher.open("/dev/ttyUSB0", LineConfig::new().baud(9600), None)?;
/// let handle = opened.into_completion().and_then(|c| c.handle()).unwrap();
///
/// dispatcher.write(
///     handle,
///     bytes::BytesMut::from(&b"hello"[..]),
///     5,
///     None,
///     Some(Box::new(|completion| println!("wrote {:?}", completion.transferred()))),
/// )?;
/// dispatcher.run()?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[derive(Clone)]
pub struct Dispatcher {
    inner: Rc<Inner>,
}

struct Inner {
    event_loop: EventLoop<Request>,
    pool: Pool,
    slots: RefCell<Slots>,
    handles: RefCell<Handles>,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("event_loop", &self.inner.event_loop)
            .field("pool", &self.inner.pool)
            .field("slots", &self.inner.slots)
            .field("handles", &self.inner.handles)
            .finish()
    }
}

impl Dispatcher {
    /// Create a dispatcher bound to `event_loop`, with a default [`Pool`].
    pub fn new(event_loop: &EventLoop<Request>) -> Self {
        Self::with_pool(event_loop, Pool::new())
    }

    /// Create a dispatcher bound to `event_loop` which runs asynchronous
    /// requests on `pool`.
    pub fn with_pool(event_loop: &EventLoop<Request>, pool: Pool) -> Self {
        Self {
            inner: Rc::new(Inner {
                event_loop: event_loop.clone(),
                pool,
                slots: RefCell::new(Slots::default()),
                handles: RefCell::new(Handles::default()),
            }),
        }
    }

    /// Returns the loop this dispatcher delivers completions on.
    pub fn event_loop(&self) -> &EventLoop<Request> {
        &self.inner.event_loop
    }

    /// Open the device at `path` and apply `config`.
    ///
    /// An unsupported baud rate or a path containing a NUL byte is rejected
    /// with [`InvalidArgument`](crate::ErrorKind::InvalidArgument).
    pub fn open(
        &self,
        path: impl AsRef<Path>,
        config: LineConfig,
        callback: Option<Callback>,
    ) -> Result<Dispatch, Error> {
        self.submit(Op::open(path.as_ref(), config)?, callback)
    }

    /// Close `handle`. A failed close still reports its error, though the
    /// handle is unusable afterwards either way.
    ///
    /// The handle is retired as soon as the close is submitted, so a second
    /// close fails with [`BadHandle`](crate::ErrorKind::BadHandle) even if
    /// the OS has since given the same descriptor to another device.
    pub fn close(
        &self,
        handle: DeviceHandle,
        callback: Option<Callback>,
    ) -> Result<Dispatch, Error> {
        self.submit(Op::Close { handle }, callback)
    }

    /// Read up to `len` bytes into the front of `buf`.
    ///
    /// The buffer travels with the request and is returned through
    /// [`Completion::take_buf`].
    pub fn read(
        &self,
        handle: DeviceHandle,
        buf: BytesMut,
        len: usize,
        offset: Option<u64>,
        callback: Option<Callback>,
    ) -> Result<Dispatch, Error> {
        let op = Op::Read {
            handle,
            buf,
            len,
            offset,
        };
        self.submit(op, callback)
    }

    /// Write the first `len` bytes of `buf`.
    pub fn write(
        &self,
        handle: DeviceHandle,
        buf: BytesMut,
        len: usize,
        offset: Option<u64>,
        callback: Option<Callback>,
    ) -> Result<Dispatch, Error> {
        let op = Op::Write {
            handle,
            buf,
            len,
            offset,
        };
        self.submit(op, callback)
    }

    /// Change the line speed of an open device, returning the effective
    /// rate. Always runs on the calling thread.
    pub fn set_baud_rate(&self, handle: DeviceHandle, baud: u32) -> Result<u32, Error> {
        self.inner.handles.borrow().check(handle)?;
        device::set_baud_rate(handle, baud)
    }

    /// Assert or clear the DTR line. Always runs on the calling thread.
    pub fn set_dtr(&self, handle: DeviceHandle, asserted: bool) -> Result<(), Error> {
        self.inner.handles.borrow().check(handle)?;
        device::set_dtr(handle, asserted)
    }

    /// Returns the number of asynchronous requests whose callback has not run yet.
    pub fn pending(&self) -> usize {
        self.inner.slots.borrow().len()
    }

    /// Deliver one batch of finished requests. Blocks for the next
    /// completion if any request is in flight.
    pub fn run_once(&self) -> io::Result<usize> {
        let inner = &self.inner;
        inner.event_loop.run_once(|request| {
            relay::deliver(&inner.event_loop, &inner.slots, &inner.handles, request)
        })
    }

    /// Deliver completions until no request is in flight.
    pub fn run(&self) -> io::Result<()> {
        let inner = &self.inner;
        inner.event_loop.run(|request| {
            relay::deliver(&inner.event_loop, &inner.slots, &inner.handles, request)
        })
    }

    fn submit(&self, op: Op, callback: Option<Callback>) -> Result<Dispatch, Error> {
        op.validate()?;
        let inner = &self.inner;
        let closing = match op.handle() {
            Some(handle) if op.kind() == Kind::Close => {
                inner.handles.borrow_mut().release(handle)?;
                Some(handle)
            }
            Some(handle) => {
                inner.handles.borrow().check(handle)?;
                None
            }
            None => None,
        };
        let mut request = Request::new(op);

        let Some(callback) = callback else {
            trace!(target: LOG, "submit.sync kind={:?}", request.kind());
            request.submit(None);
            request.run();
            let (_, completion) = request.into_parts();
            if let Some(handle) = completion.handle() {
                inner.handles.borrow_mut().track(handle);
            }
            return Ok(Dispatch::Complete(completion));
        };

        let token = inner.slots.borrow_mut().insert(callback);
        trace!(target: LOG, "submit.async kind={:?} {:?}", request.kind(), token);
        request.submit(Some(token));
        request.start();
        inner.event_loop.ref_work();

        let poster = inner.event_loop.poster();
        if let Err(err) = inner.pool.spawn(move || relay::execute(request, &poster)) {
            debug!(target: LOG, "submit.spawn_failed {:?}: {}", token, err);
            inner.slots.borrow_mut().remove(token);
            inner.event_loop.unref_work();
            // The close never ran, so the handle is still open.
            if let Some(handle) = closing {
                inner.handles.borrow_mut().track(handle);
            }
            return Err(err);
        }
        Ok(Dispatch::Pending(token))
    }
}
