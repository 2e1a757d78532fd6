//! The request object shuttled between dispatch and completion.
//!
//! A [`Request`] carries exactly one operation from submission to its
//! outcome. It is created immediately before submission, moved to a worker
//! for asynchronous execution, moved back through the owning loop's
//! completion queue, and dropped once its callback has run.
use std::ffi::CString;
use std::fmt;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use bytes::BytesMut;
use log::trace;

use crate::device::{self, DeviceHandle, LineConfig};
use crate::error::Error;

const LOG: &str = "serial_native::request";

/// The kind of operation a request performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    /// Open a device.
    Open,
    /// Close a device handle.
    Close,
    /// Read from a device handle.
    Read,
    /// Write to a device handle.
    Write,
}

/// Identifies a pending asynchronous request on its owning loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(pub(crate) usize);

/// An operation together with its arguments.
///
/// Each variant carries exactly the payload its device operation needs.
pub(crate) enum Op {
    Open {
        path: CString,
        config: LineConfig,
    },
    Close {
        handle: DeviceHandle,
    },
    Read {
        handle: DeviceHandle,
        buf: BytesMut,
        len: usize,
        offset: Option<u64>,
    },
    Write {
        handle: DeviceHandle,
        buf: BytesMut,
        len: usize,
        offset: Option<u64>,
    },
}

impl fmt::Debug for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Op::Open { path, config } => f
                .debug_struct("Open")
                .field("path", path)
                .field("config", config)
                .finish(),
            Op::Close { handle } => f.debug_struct("Close").field("handle", handle).finish(),
            Op::Read {
                handle,
                len,
                offset,
                ..
            } => f
                .debug_struct("Read")
                .field("handle", handle)
                .field("len", len)
                .field("offset", offset)
                .finish(),
            Op::Write {
                handle,
                len,
                offset,
                ..
            } => f
                .debug_struct("Write")
                .field("handle", handle)
                .field("len", len)
                .field("offset", offset)
                .finish(),
        }
    }
}

impl Op {
    pub(crate) fn open(path: &Path, config: LineConfig) -> Result<Self, Error> {
        // Rejects unknown baud rates before anything is submitted.
        config.speed()?;
        Ok(Op::Open {
            path: encode_path(path)?,
            config,
        })
    }

    pub(crate) fn kind(&self) -> Kind {
        match self {
            Op::Open { .. } => Kind::Open,
            Op::Close { .. } => Kind::Close,
            Op::Read { .. } => Kind::Read,
            Op::Write { .. } => Kind::Write,
        }
    }

    /// Returns the handle an operation on an open device acts on.
    pub(crate) fn handle(&self) -> Option<DeviceHandle> {
        match self {
            Op::Open { .. } => None,
            Op::Close { handle } | Op::Read { handle, .. } | Op::Write { handle, .. } => {
                Some(*handle)
            }
        }
    }

    /// Check argument shapes. Runs on the submitting thread before any syscall.
    pub(crate) fn validate(&self) -> Result<(), Error> {
        match self {
            Op::Open { .. } => Ok(()),
            Op::Close { handle } => handle.checked().map(drop),
            Op::Read {
                handle,
                buf,
                len,
                offset,
            }
            | Op::Write {
                handle,
                buf,
                len,
                offset,
            } => {
                handle.checked()?;
                validate_transfer(buf.len(), *len, *offset)
            }
        }
    }

    /// Perform the blocking device operation.
    fn run(self) -> Completion {
        let kind = self.kind();
        let (result, buf) = match self {
            Op::Open { path, config } => (device::open(&path, &config).map(Output::Opened), None),
            Op::Close { handle } => (device::close(handle).map(|()| Output::Closed), None),
            Op::Read {
                handle,
                mut buf,
                len,
                offset,
            } => {
                let result = device::read(handle, &mut buf[..len], offset);
                (result.map(Output::Transferred), Some(buf))
            }
            Op::Write {
                handle,
                buf,
                len,
                offset,
            } => {
                let result = device::write(handle, &buf[..len], offset);
                (result.map(Output::Transferred), Some(buf))
            }
        };
        Completion { kind, result, buf }
    }
}

/// Validate a read or write of `len` bytes against a buffer of `capacity` bytes.
fn validate_transfer(
    capacity: usize,
    len: usize,
    offset: Option<u64>,
) -> Result<(), Error> {
    if len > capacity || len > i32::MAX as usize {
        return Err(Error::invalid_argument());
    }
    if let Some(offset) = offset {
        libc::off_t::try_from(offset).map_err(|_| Error::invalid_argument())?;
    }
    Ok(())
}

/// Convert `path` into a NUL-terminated string, failing softly on allocation failure.
fn encode_path(path: &Path) -> Result<CString, Error> {
    let bytes = path.as_os_str().as_bytes();
    let mut encoded = Vec::new();
    encoded
        .try_reserve_exact(bytes.len() + 1)
        .map_err(|_| Error::out_of_memory())?;
    encoded.extend_from_slice(bytes);
    CString::new(encoded).map_err(|_| Error::invalid_argument())
}

/// The successful outcome of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Output {
    /// The device was opened.
    Opened(DeviceHandle),
    /// The handle was released.
    Closed,
    /// The number of bytes read or written.
    Transferred(usize),
}

/// The outcome of a finished request, delivered to its consumer.
///
/// For reads and writes the completion hands the buffer back to the caller.
#[derive(Debug)]
pub struct Completion {
    kind: Kind,
    result: Result<Output, Error>,
    buf: Option<BytesMut>,
}

impl Completion {
    /// Returns the kind of the request which produced this completion.
    pub fn kind(&self) -> Kind {
        self.kind
    }

    /// Returns the outcome.
    pub fn result(&self) -> Result<Output, &Error> {
        self.result.as_ref().map(|output| *output)
    }

    /// Returns the error, if the operation failed.
    pub fn error(&self) -> Option<&Error> {
        self.result.as_ref().err()
    }

    /// Returns the signed integer outcome: bytes transferred, the new handle,
    /// zero for a close, or `-1` on failure.
    pub fn raw_result(&self) -> i64 {
        match &self.result {
            Ok(Output::Opened(handle)) => i64::from(handle.as_raw()),
            Ok(Output::Closed) => 0,
            Ok(Output::Transferred(n)) => *n as i64,
            Err(_) => -1,
        }
    }

    /// Returns the number of bytes transferred by a successful read or write.
    pub fn transferred(&self) -> Option<usize> {
        match self.result {
            Ok(Output::Transferred(n)) => Some(n),
            _ => None,
        }
    }

    /// Returns the handle produced by a successful open.
    pub fn handle(&self) -> Option<DeviceHandle> {
        match self.result {
            Ok(Output::Opened(handle)) => Some(handle),
            _ => None,
        }
    }

    /// Take back the buffer of a read or write.
    pub fn take_buf(&mut self) -> Option<BytesMut> {
        self.buf.take()
    }

    /// Consume the completion, returning the outcome.
    pub fn into_result(self) -> Result<Output, Error> {
        self.result
    }

    #[cfg(test)]
    fn error_kind(&self) -> Option<crate::error::ErrorKind> {
        self.error().map(Error::kind)
    }
}

/// The lifecycle of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum State {
    Created,
    Submitted,
    Executing,
    Completed,
}

/// A unit of work for one open, close, read or write.
///
/// Requests are move-only. While asynchronous work is in flight exactly one
/// thread owns the request: the worker until it posts it, then the loop.
pub struct Request {
    token: Option<Token>,
    kind: Kind,
    op: Option<Op>,
    state: State,
    completion: Option<Completion>,
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("token", &self.token)
            .field("kind", &self.kind)
            .field("state", &self.state)
            .finish()
    }
}

impl Request {
    pub(crate) fn new(op: Op) -> Self {
        Self {
            token: None,
            kind: op.kind(),
            op: Some(op),
            state: State::Created,
            completion: None,
        }
    }

    pub(crate) fn kind(&self) -> Kind {
        self.kind
    }

    #[cfg(test)]
    fn state(&self) -> State {
        self.state
    }

    fn transition(&mut self, from: State, to: State) {
        assert_eq!(
            self.state, from,
            "request {:?} cannot move to {:?}",
            self.kind, to
        );
        trace!(target: LOG, "request.state {:?} {:?} -> {:?}", self.kind, from, to);
        self.state = to;
    }

    /// Created -> Submitted. Asynchronous requests carry the token of their pending slot.
    pub(crate) fn submit(&mut self, token: Option<Token>) {
        self.transition(State::Created, State::Submitted);
        self.token = token;
    }

    /// Submitted -> Executing, as the request is handed to a worker.
    pub(crate) fn start(&mut self) {
        self.transition(State::Submitted, State::Executing);
    }

    /// Run the device operation and record its outcome.
    ///
    /// Synchronous requests go Submitted -> Completed, asynchronous ones
    /// Executing -> Completed.
    pub(crate) fn run(&mut self) {
        let from = match self.state {
            State::Submitted if self.token.is_none() => State::Submitted,
            _ => State::Executing,
        };
        let Some(op) = self.op.take() else {
            panic!("request {:?} has already run", self.kind);
        };
        self.completion = Some(op.run());
        self.transition(from, State::Completed);
    }

    /// Split a completed request into its token and outcome.
    pub(crate) fn into_parts(mut self) -> (Option<Token>, Completion) {
        let Some(completion) = self.completion.take() else {
            panic!("request {:?} delivered before completion", self.kind);
        };
        (self.token, completion)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn read_op(capacity: usize, len: usize) -> Op {
        Op::Read {
            handle: DeviceHandle::from_raw(0),
            buf: BytesMut::zeroed(capacity),
            len,
            offset: None,
        }
    }

    #[test]
    fn validate_rejects_len_past_capacity() {
        let err = read_op(64, 65).validate().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        read_op(64, 64).validate().unwrap();
        read_op(64, 0).validate().unwrap();
    }

    #[test]
    fn validate_rejects_negative_handle() {
        let op = Op::Close {
            handle: DeviceHandle::from_raw(-1),
        };
        assert_eq!(op.validate().unwrap_err().kind(), ErrorKind::BadHandle);
    }

    #[test]
    fn open_rejects_interior_nul_and_bad_baud() {
        use std::ffi::OsStr;

        let path = Path::new(OsStr::from_bytes(b"/dev/tty\0S0"));
        let err = Op::open(path, LineConfig::new()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        let err = Op::open(Path::new("/dev/ttyS0"), LineConfig::new().baud(7)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn sync_lifecycle() {
        let op = Op::Close {
            handle: DeviceHandle::from_raw(-1),
        };
        let mut request = Request::new(op);
        assert_eq!(request.state(), State::Created);
        request.submit(None);
        request.run();
        assert_eq!(request.state(), State::Completed);
        let (token, completion) = request.into_parts();
        assert_eq!(token, None);
        assert_eq!(completion.kind(), Kind::Close);
        assert_eq!(completion.error_kind(), Some(ErrorKind::BadHandle));
        assert_eq!(completion.raw_result(), -1);
    }

    #[test]
    fn async_lifecycle() {
        let op = Op::Read {
            handle: DeviceHandle::from_raw(-1),
            buf: BytesMut::zeroed(8),
            len: 8,
            offset: None,
        };
        let mut request = Request::new(op);
        request.submit(Some(Token(3)));
        request.start();
        assert_eq!(request.state(), State::Executing);
        request.run();
        let (token, mut completion) = request.into_parts();
        assert_eq!(token, Some(Token(3)));
        assert_eq!(completion.kind(), Kind::Read);
        assert_eq!(completion.error_kind(), Some(ErrorKind::BadHandle));
        // The buffer comes back even when the read fails.
        assert_eq!(completion.take_buf().map(|b| b.len()), Some(8));
    }

    #[test]
    #[should_panic(expected = "cannot move")]
    fn start_requires_submit() {
        let mut request = Request::new(read_op(1, 1));
        request.start();
    }
}
