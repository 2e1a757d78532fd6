//! # Device Operations
//!
//! The blocking primitives performed directly against a serial device:
//! open, close, read and write, plus the two line-control calls.
//!
//! These functions block the calling thread for the duration of the
//! syscall. The [`Dispatcher`] decides whether that thread is the caller's
//! or a worker's.
//!
//! Handles are opened non-blocking, so a read which finds no data returns
//! zero bytes and a write which cannot make progress returns zero bytes
//! written. Neither is an error.
//!
//! [`Dispatcher`]: crate::Dispatcher
use std::ffi::CStr;
use std::os::unix::io::{AsRawFd, RawFd};

use log::{debug, trace, warn};

use crate::error::{Error, ErrorKind};

mod line;

pub(crate) use line::{baud_rate, set_speed, speed_constant};
pub use line::{DataBits, FlowControl, LineConfig, Parity, StopBits};

const LOG: &str = "serial_native::device";

/// An identifier for an open serial device.
///
/// The handle is a plain descriptor value. It is owned by the caller from
/// the successful open until the caller closes it; nothing in this crate
/// closes a handle implicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceHandle(RawFd);

impl DeviceHandle {
    /// Wrap a raw descriptor.
    pub fn from_raw(fd: RawFd) -> Self {
        Self(fd)
    }

    /// Returns the raw descriptor.
    pub fn as_raw(&self) -> RawFd {
        self.0
    }

    /// Returns the descriptor, rejecting values which can never be open.
    pub(crate) fn checked(self) -> Result<RawFd, Error> {
        if self.0 < 0 {
            return Err(Error::bad_handle());
        }
        Ok(self.0)
    }
}

impl AsRawFd for DeviceHandle {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

fn cvt(res: libc::c_int) -> Result<libc::c_int, Error> {
    if res == -1 {
        return Err(Error::last_os_error());
    }
    Ok(res)
}

fn would_block(err: &Error) -> bool {
    matches!(err.raw_os_error(), Some(code) if code == libc::EAGAIN || code == libc::EWOULDBLOCK)
}

fn get_attrs(fd: RawFd) -> Result<libc::termios, Error> {
    // Safety: termios is a plain C struct; tcgetattr overwrites it.
    let mut termios: libc::termios = unsafe { std::mem::zeroed() };
    cvt(unsafe { libc::tcgetattr(fd, &mut termios) })?;
    Ok(termios)
}

/// Open the device at `path` for exclusive read/write access and apply `config`.
pub(crate) fn open(path: &CStr, config: &LineConfig) -> Result<DeviceHandle, Error> {
    let flags = libc::O_RDWR | libc::O_NOCTTY | libc::O_NONBLOCK | libc::O_CLOEXEC;
    let fd = cvt(unsafe { libc::open(path.as_ptr(), flags) })?;
    trace!(target: LOG, "open.fd {} {:?}", fd, path);

    if let Err(err) = configure(fd, config) {
        // The handle never reached the caller, so it is ours to release.
        if unsafe { libc::close(fd) } == -1 {
            warn!(target: LOG, "open.close_failed: {}", Error::last_os_error());
        }
        return Err(err);
    }
    Ok(DeviceHandle(fd))
}

fn configure(fd: RawFd, config: &LineConfig) -> Result<(), Error> {
    cvt(unsafe { libc::ioctl(fd, libc::TIOCEXCL) })?;
    let mut termios = get_attrs(fd)?;
    config.apply(&mut termios)?;
    cvt(unsafe { libc::tcflush(fd, libc::TCIFLUSH) })?;
    cvt(unsafe { libc::tcsetattr(fd, libc::TCSANOW, &termios) })?;
    Ok(())
}

/// Release `handle`. Fails with [`BadHandle`] if it is not open.
///
/// [`BadHandle`]: crate::ErrorKind::BadHandle
pub(crate) fn close(handle: DeviceHandle) -> Result<(), Error> {
    let fd = handle.checked()?;
    // No retry on EINTR: the descriptor is released either way.
    cvt(unsafe { libc::close(fd) })?;
    Ok(())
}

/// Perform at most one read of up to `buf.len()` bytes.
pub(crate) fn read(handle: DeviceHandle, buf: &mut [u8], offset: Option<u64>) -> Result<usize, Error> {
    let fd = handle.checked()?;
    let ptr = buf.as_mut_ptr().cast::<libc::c_void>();
    let len = buf.len();

    let res = match offset {
        Some(offset) => {
            let offset = to_off(offset)?;
            let res = unsafe { libc::pread(fd, ptr, len, offset) };
            if res == -1 && errno() == libc::ESPIPE {
                debug!(target: LOG, "read.offset_ignored fd={} offset={}", fd, offset);
                unsafe { libc::read(fd, ptr, len) }
            } else {
                res
            }
        }
        None => unsafe { libc::read(fd, ptr, len) },
    };
    transferred(res)
}

/// Perform at most one write of up to `buf.len()` bytes.
pub(crate) fn write(handle: DeviceHandle, buf: &[u8], offset: Option<u64>) -> Result<usize, Error> {
    let fd = handle.checked()?;
    let ptr = buf.as_ptr().cast::<libc::c_void>();
    let len = buf.len();

    let res = match offset {
        Some(offset) => {
            let offset = to_off(offset)?;
            let res = unsafe { libc::pwrite(fd, ptr, len, offset) };
            if res == -1 && errno() == libc::ESPIPE {
                debug!(target: LOG, "write.offset_ignored fd={} offset={}", fd, offset);
                unsafe { libc::write(fd, ptr, len) }
            } else {
                res
            }
        }
        None => unsafe { libc::write(fd, ptr, len) },
    };
    transferred(res)
}

fn errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

fn to_off(offset: u64) -> Result<libc::off_t, Error> {
    libc::off_t::try_from(offset).map_err(|_| Error::invalid_argument())
}

fn transferred(res: libc::ssize_t) -> Result<usize, Error> {
    if res >= 0 {
        return Ok(res as usize);
    }
    let err = Error::last_os_error();
    if would_block(&err) {
        return Ok(0);
    }
    Err(err)
}

/// Change the line speed, returning the speed the device reports afterwards.
///
/// Fails with [`Unsupported`] if the device reads back a speed outside the
/// baud table, rather than echoing the requested rate.
///
/// [`Unsupported`]: crate::ErrorKind::Unsupported
pub(crate) fn set_baud_rate(handle: DeviceHandle, baud: u32) -> Result<u32, Error> {
    let fd = handle.checked()?;
    let speed = speed_constant(baud).ok_or_else(Error::invalid_argument)?;
    let mut termios = get_attrs(fd)?;
    set_speed(&mut termios, speed)?;
    cvt(unsafe { libc::tcflush(fd, libc::TCIFLUSH) })?;
    cvt(unsafe { libc::tcsetattr(fd, libc::TCSANOW, &termios) })?;

    let applied = get_attrs(fd)?;
    effective_baud(unsafe { libc::cfgetospeed(&applied) })
}

fn effective_baud(speed: libc::speed_t) -> Result<u32, Error> {
    baud_rate(speed).ok_or_else(|| {
        warn!(target: LOG, "baud.unmapped speed={:#o}", speed);
        Error::new(ErrorKind::Unsupported)
    })
}

/// Assert or clear the DTR modem line.
pub(crate) fn set_dtr(handle: DeviceHandle, asserted: bool) -> Result<(), Error> {
    let fd = handle.checked()?;
    let bits: libc::c_int = libc::TIOCM_DTR;
    let request = if asserted {
        libc::TIOCMBIS
    } else {
        libc::TIOCMBIC
    };
    cvt(unsafe { libc::ioctl(fd, request, &bits as *const libc::c_int) })?;
    Ok(())
}
