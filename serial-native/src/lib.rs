//! Serial device I/O for a single-threaded host.
//!
//! Blocking serial syscalls run either inline on the calling thread or on a
//! pool of worker threads, and asynchronous results come back to the host's
//! [`EventLoop`] where each callback runs exactly once.
//!
//! # Modules
//! - `device`: the blocking open, close, read and write primitives and line configuration.
//! - `request`: the request object and its outcome.
//! - `dispatch`: the synchronous/asynchronous split.
//! - `pool`: worker threads for asynchronous requests.
//! - `relay`: completion delivery on the loop thread.
//! - [`binding`]: dynamically typed entry points for a host runtime.
//! - `error`: the normalized error taxonomy.
#![cfg(unix)]
#![deny(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    clippy::missing_safety_doc
)]

pub mod binding;
mod device;
mod dispatch;
mod error;
mod pool;
mod relay;
mod request;

pub use device::{DataBits, DeviceHandle, FlowControl, LineConfig, Parity, StopBits};
pub use dispatch::{Dispatch, Dispatcher};
pub use error::{translate, translate_win32, Error, ErrorKind};
pub use pool::{Pool, PoolBuilder};
pub use relay::Callback;
pub use request::{Completion, Kind, Output, Request, Token};
pub use serial_loop::{EventLoop, ParkMode};
