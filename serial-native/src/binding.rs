//! The entry points a host runtime calls.
//!
//! Host values arrive as a list of dynamically typed [`Value`]s. Every entry
//! point checks argument shapes first and fails with
//! [`InvalidArgument`](crate::ErrorKind::InvalidArgument) without touching
//! the device. A trailing [`Value::Function`] selects asynchronous mode: the
//! call returns [`Value::Undefined`] and the callback later receives
//! `(error, result)` on the loop thread.
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use bytes::BytesMut;
use log::trace;

use crate::device::{DeviceHandle, LineConfig};
use crate::dispatch::{Dispatch, Dispatcher};
use crate::error::Error;
use crate::relay::Callback;
use crate::request::{Completion, Kind, Output};

const LOG: &str = "serial_native::binding";

/// A byte region owned by the host. Clones share the same bytes.
#[derive(Debug, Clone, Default)]
pub struct HostBuffer(Rc<RefCell<BytesMut>>);

impl HostBuffer {
    /// A zero-filled buffer of `len` bytes.
    pub fn zeroed(len: usize) -> Self {
        Self::from(BytesMut::zeroed(len))
    }

    /// Returns the buffer length.
    pub fn len(&self) -> usize {
        self.0.borrow().len()
    }

    /// Returns true if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy out the current contents.
    pub fn to_vec(&self) -> Vec<u8> {
        self.0.borrow().to_vec()
    }

    fn snapshot(&self) -> BytesMut {
        BytesMut::from(&self.0.borrow()[..])
    }

    fn fill_from(&self, src: &[u8]) {
        let mut dst = self.0.borrow_mut();
        let n = src.len().min(dst.len());
        dst[..n].copy_from_slice(&src[..n]);
    }
}

impl From<BytesMut> for HostBuffer {
    fn from(buf: BytesMut) -> Self {
        Self(Rc::new(RefCell::new(buf)))
    }
}

impl From<&[u8]> for HostBuffer {
    fn from(bytes: &[u8]) -> Self {
        Self::from(BytesMut::from(bytes))
    }
}

/// A host function, called at most once with `(error, result)`.
pub struct HostCallback(Box<dyn FnOnce(Option<Error>, Value)>);

impl HostCallback {
    /// Wrap a closure.
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce(Option<Error>, Value) + 'static,
    {
        Self(Box::new(f))
    }

    fn call(self, error: Option<Error>, result: Value) {
        (self.0)(error, result)
    }
}

impl fmt::Debug for HostCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("HostCallback")
    }
}

/// A dynamically typed host value.
pub enum Value {
    /// An integer.
    Int(i64),
    /// A boolean.
    Bool(bool),
    /// A string.
    Str(String),
    /// A byte region.
    Buffer(HostBuffer),
    /// A callable.
    Function(HostCallback),
    /// No value. Also the pending indicator of asynchronous calls.
    Undefined,
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(n) => f.debug_tuple("Int").field(n).finish(),
            Value::Bool(b) => f.debug_tuple("Bool").field(b).finish(),
            Value::Str(s) => f.debug_tuple("Str").field(s).finish(),
            Value::Buffer(buf) => f.debug_tuple("Buffer").field(&buf.len()).finish(),
            Value::Function(_) => f.write_str("Function"),
            Value::Undefined => f.write_str("Undefined"),
        }
    }
}

impl Value {
    /// Returns the integer, if this is one.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// Returns true for [`Value::Undefined`].
    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    /// Wrap a closure as a [`Value::Function`].
    pub fn function<F>(f: F) -> Self
    where
        F: FnOnce(Option<Error>, Value) + 'static,
    {
        Value::Function(HostCallback::new(f))
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Int(i64::from(n))
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_owned())
    }
}

impl From<HostBuffer> for Value {
    fn from(buf: HostBuffer) -> Self {
        Value::Buffer(buf)
    }
}

/// Positional argument list with shape checks.
struct Args {
    values: Vec<Option<Value>>,
    callback: Option<HostCallback>,
}

impl Args {
    fn new(mut values: Vec<Value>) -> Self {
        let callback = if matches!(values.last(), Some(Value::Function(_))) {
            match values.pop() {
                Some(Value::Function(callback)) => Some(callback),
                _ => None,
            }
        } else {
            None
        };
        Self {
            values: values.into_iter().map(Some).collect(),
            callback,
        }
    }

    fn take(&mut self, idx: usize) -> Option<Value> {
        self.values.get_mut(idx).and_then(Option::take)
    }

    fn int(&mut self, idx: usize) -> Result<i32, Error> {
        match self.take(idx) {
            Some(Value::Int(n)) => i32::try_from(n).map_err(|_| Error::invalid_argument()),
            _ => Err(Error::invalid_argument()),
        }
    }

    /// Missing or undefined values take the default.
    fn int_or(&mut self, idx: usize, default: i32) -> Result<i32, Error> {
        match self.take(idx) {
            None | Some(Value::Undefined) => Ok(default),
            Some(Value::Int(n)) => i32::try_from(n).map_err(|_| Error::invalid_argument()),
            Some(_) => Err(Error::invalid_argument()),
        }
    }

    fn handle(&mut self, idx: usize) -> Result<DeviceHandle, Error> {
        self.int(idx).map(DeviceHandle::from_raw)
    }

    fn string(&mut self, idx: usize) -> Result<String, Error> {
        match self.take(idx) {
            Some(Value::Str(s)) => Ok(s),
            _ => Err(Error::invalid_argument()),
        }
    }

    fn buffer(&mut self, idx: usize) -> Result<HostBuffer, Error> {
        match self.take(idx) {
            Some(Value::Buffer(buf)) => Ok(buf),
            _ => Err(Error::invalid_argument()),
        }
    }

    fn boolean(&mut self, idx: usize) -> Result<bool, Error> {
        match self.take(idx) {
            Some(Value::Bool(b)) => Ok(b),
            _ => Err(Error::invalid_argument()),
        }
    }
}

/// The serial port entry points, bound to one dispatcher.
#[derive(Debug, Clone)]
pub struct SerialPort {
    dispatcher: Dispatcher,
}

impl SerialPort {
    /// Bind the entry points to `dispatcher`.
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self { dispatcher }
    }

    /// Returns the underlying dispatcher.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// `open(path, baud?, data_bits?, stop_bits?, parity?, flow_control?, callback?)`
    ///
    /// Returns the new handle as an integer.
    pub fn open(&self, args: Vec<Value>) -> Result<Value, Error> {
        let mut args = Args::new(args);
        let path = args.string(0)?;
        let config = LineConfig::from_raw(
            args.int_or(1, 38_400)?,
            args.int_or(2, 8)?,
            args.int_or(3, 1)?,
            args.int_or(4, 0)?,
            args.int_or(5, 0)?,
        )?;
        trace!(target: LOG, "open {:?} {:?}", path, config);
        let callback = args.callback.map(|cb| relay_to(cb, Value::from_completion));
        let dispatch = self.dispatcher.open(path, config, callback)?;
        finish(dispatch, Value::from_completion)
    }

    /// `close(handle, callback?)`
    pub fn close(&self, args: Vec<Value>) -> Result<Value, Error> {
        let mut args = Args::new(args);
        let handle = args.handle(0)?;
        let callback = args.callback.map(|cb| relay_to(cb, |_| Value::Undefined));
        let dispatch = self.dispatcher.close(handle, callback)?;
        finish(dispatch, |_| Value::Undefined)
    }

    /// `read(handle, buffer, length, callback?)`
    ///
    /// Reads up to `length` bytes into the front of `buffer` and returns the
    /// byte count.
    pub fn read(&self, args: Vec<Value>) -> Result<Value, Error> {
        let mut args = Args::new(args);
        let handle = args.handle(0)?;
        let target = args.buffer(1)?;
        let len = usize::try_from(args.int(2)?).map_err(|_| Error::invalid_argument())?;
        if len > target.len() {
            return Err(Error::invalid_argument());
        }

        // The worker reads into its own region; the bytes land in the host
        // buffer on the loop thread.
        let scratch = BytesMut::zeroed(len);
        let copy_back = move |completion: &mut Completion| {
            if let (Some(n), Some(buf)) = (completion.transferred(), completion.take_buf()) {
                target.fill_from(&buf[..n]);
            }
            Value::from_completion(completion)
        };

        match args.callback {
            Some(cb) => {
                let callback: Callback = Box::new(move |mut completion| {
                    let result = copy_back(&mut completion);
                    cb.call(completion.into_result().err(), result);
                });
                self.dispatcher
                    .read(handle, scratch, len, None, Some(callback))?;
                Ok(Value::Undefined)
            }
            None => {
                let dispatch = self.dispatcher.read(handle, scratch, len, None, None)?;
                finish(dispatch, copy_back)
            }
        }
    }

    /// `write(handle, buffer, callback?)`
    ///
    /// Writes the whole buffer in at most one call and returns the byte count.
    pub fn write(&self, args: Vec<Value>) -> Result<Value, Error> {
        let mut args = Args::new(args);
        let handle = args.handle(0)?;
        let source = args.buffer(1)?;
        let payload = source.snapshot();
        let len = payload.len();
        let callback = args.callback.map(|cb| relay_to(cb, Value::from_completion));
        let dispatch = self.dispatcher.write(handle, payload, len, None, callback)?;
        finish(dispatch, Value::from_completion)
    }

    /// `set_baud_rate(handle, baud)`
    ///
    /// Returns the rate the device reports after the change.
    pub fn set_baud_rate(&self, args: Vec<Value>) -> Result<Value, Error> {
        let mut args = Args::new(args);
        let handle = args.handle(0)?;
        let baud = u32::try_from(args.int(1)?).map_err(|_| Error::invalid_argument())?;
        let effective = self.dispatcher.set_baud_rate(handle, baud)?;
        Ok(Value::Int(i64::from(effective)))
    }

    /// `set_dtr(handle, asserted)`
    pub fn set_dtr(&self, args: Vec<Value>) -> Result<Value, Error> {
        let mut args = Args::new(args);
        let handle = args.handle(0)?;
        let asserted = args.boolean(1)?;
        self.dispatcher.set_dtr(handle, asserted)?;
        Ok(Value::Undefined)
    }
}

impl Value {
    fn from_completion(completion: &mut Completion) -> Value {
        match completion.result() {
            Ok(Output::Opened(handle)) => Value::from(handle.as_raw()),
            Ok(Output::Transferred(n)) => Value::Int(n as i64),
            Ok(Output::Closed) => Value::Undefined,
            Err(_) if completion.kind() == Kind::Close => Value::Undefined,
            Err(_) => Value::Int(-1),
        }
    }
}

/// Adapt a host callback to a completion callback.
fn relay_to<F>(cb: HostCallback, convert: F) -> Callback
where
    F: FnOnce(&mut Completion) -> Value + 'static,
{
    Box::new(move |mut completion| {
        let result = convert(&mut completion);
        cb.call(completion.into_result().err(), result);
    })
}

/// Turn a dispatch into the value returned to the host.
fn finish<F>(dispatch: Dispatch, convert: F) -> Result<Value, Error>
where
    F: FnOnce(&mut Completion) -> Value,
{
    match dispatch {
        Dispatch::Pending(_) => Ok(Value::Undefined),
        Dispatch::Complete(mut completion) => {
            let value = convert(&mut completion);
            completion.into_result()?;
            Ok(value)
        }
    }
}
