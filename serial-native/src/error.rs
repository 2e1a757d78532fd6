//! Normalized errors shared by every serial operation.
//!
//! Operating-system failures are translated once, at the point where the
//! syscall returns, into the closed [`ErrorKind`] set. The raw code is kept
//! alongside for diagnostics.
use std::io;

/// The platform-independent error taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
pub enum ErrorKind {
    /// The device or path does not exist.
    #[error("no such device")]
    NotFound,
    /// The device exists but may not be opened or used by this process.
    #[error("access denied")]
    AccessDenied,
    /// The resource already exists.
    #[error("already exists")]
    AlreadyExists,
    /// An argument had the wrong shape or an out-of-range value.
    #[error("invalid argument")]
    InvalidArgument,
    /// An allocation needed to perform the request failed.
    #[error("out of memory")]
    OutOfMemory,
    /// The connection was reset by the peer.
    #[error("connection reset")]
    ConnectionReset,
    /// The connection was aborted locally.
    #[error("connection aborted")]
    ConnectionAborted,
    /// The operation timed out.
    #[error("timed out")]
    TimedOut,
    /// The device or platform does not support the operation.
    #[error("operation not supported")]
    Unsupported,
    /// The other end of the line has gone away.
    #[error("end of stream")]
    EndOfStream,
    /// The device handle is not open.
    #[error("bad device handle")]
    BadHandle,
    /// Any failure without a more specific mapping.
    #[error("unknown error")]
    Unknown,
}

/// Error returned from serial operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}")]
pub struct Error {
    kind: ErrorKind,
    raw_os_error: Option<i32>,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            raw_os_error: None,
        }
    }

    pub(crate) fn invalid_argument() -> Self {
        Self::new(ErrorKind::InvalidArgument)
    }

    pub(crate) fn bad_handle() -> Self {
        Self::new(ErrorKind::BadHandle)
    }

    pub(crate) fn out_of_memory() -> Self {
        Self::new(ErrorKind::OutOfMemory)
    }

    /// Build an error from a raw `errno` value.
    pub fn from_raw_os_error(code: i32) -> Self {
        Self {
            kind: translate(code),
            raw_os_error: Some(code),
        }
    }

    /// Build an error from the calling thread's current `errno`.
    pub(crate) fn last_os_error() -> Self {
        match io::Error::last_os_error().raw_os_error() {
            Some(code) => Self::from_raw_os_error(code),
            None => Self::new(ErrorKind::Unknown),
        }
    }

    /// Returns the normalized kind of this error.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns the OS error code this error was translated from, if any.
    pub fn raw_os_error(&self) -> Option<i32> {
        self.raw_os_error
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind)
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        if let Some(code) = err.raw_os_error() {
            return Self::from_raw_os_error(code);
        }
        let kind = match err.kind() {
            io::ErrorKind::NotFound => ErrorKind::NotFound,
            io::ErrorKind::PermissionDenied => ErrorKind::AccessDenied,
            io::ErrorKind::AlreadyExists => ErrorKind::AlreadyExists,
            io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData => {
                ErrorKind::InvalidArgument
            }
            io::ErrorKind::OutOfMemory => ErrorKind::OutOfMemory,
            io::ErrorKind::ConnectionReset => ErrorKind::ConnectionReset,
            io::ErrorKind::ConnectionAborted => ErrorKind::ConnectionAborted,
            io::ErrorKind::TimedOut => ErrorKind::TimedOut,
            io::ErrorKind::Unsupported => ErrorKind::Unsupported,
            io::ErrorKind::UnexpectedEof | io::ErrorKind::BrokenPipe => ErrorKind::EndOfStream,
            _ => ErrorKind::Unknown,
        };
        Self::new(kind)
    }
}

impl From<Error> for io::Error {
    fn from(value: Error) -> Self {
        if let Some(code) = value.raw_os_error {
            return io::Error::from_raw_os_error(code);
        }
        let kind = match value.kind {
            ErrorKind::NotFound => io::ErrorKind::NotFound,
            ErrorKind::AccessDenied => io::ErrorKind::PermissionDenied,
            ErrorKind::AlreadyExists => io::ErrorKind::AlreadyExists,
            ErrorKind::InvalidArgument | ErrorKind::BadHandle => io::ErrorKind::InvalidInput,
            ErrorKind::OutOfMemory => io::ErrorKind::OutOfMemory,
            ErrorKind::ConnectionReset => io::ErrorKind::ConnectionReset,
            ErrorKind::ConnectionAborted => io::ErrorKind::ConnectionAborted,
            ErrorKind::TimedOut => io::ErrorKind::TimedOut,
            ErrorKind::Unsupported => io::ErrorKind::Unsupported,
            ErrorKind::EndOfStream => io::ErrorKind::UnexpectedEof,
            ErrorKind::Unknown => io::ErrorKind::Other,
        };
        io::Error::new(kind, value)
    }
}

/// Translate a POSIX `errno` value into an [`ErrorKind`].
///
/// Total over `i32`: codes without a specific mapping become
/// [`ErrorKind::Unknown`].
pub fn translate(code: i32) -> ErrorKind {
    match code {
        libc::ENOENT | libc::ENXIO | libc::ENODEV | libc::ENOTDIR => ErrorKind::NotFound,
        libc::EACCES | libc::EPERM | libc::EROFS | libc::EBUSY => ErrorKind::AccessDenied,
        libc::EEXIST => ErrorKind::AlreadyExists,
        libc::EINVAL | libc::ENAMETOOLONG | libc::EOVERFLOW | libc::EFAULT | libc::EMSGSIZE => {
            ErrorKind::InvalidArgument
        }
        libc::ENOMEM | libc::ENOBUFS => ErrorKind::OutOfMemory,
        libc::ECONNRESET => ErrorKind::ConnectionReset,
        libc::ECONNABORTED => ErrorKind::ConnectionAborted,
        libc::ETIMEDOUT => ErrorKind::TimedOut,
        libc::ENOSYS | libc::ENOTTY | libc::ESPIPE | libc::ENOTSUP => ErrorKind::Unsupported,
        // EOPNOTSUPP aliases ENOTSUP on some platforms but not all.
        code if code == libc::EOPNOTSUPP => ErrorKind::Unsupported,
        libc::EPIPE => ErrorKind::EndOfStream,
        libc::EBADF => ErrorKind::BadHandle,
        _ => ErrorKind::Unknown,
    }
}

/// Translate a Win32 system error code into an [`ErrorKind`].
///
/// The COM-port backend on Windows reports `GetLastError()` codes rather
/// than `errno`. Total over `u32`.
pub fn translate_win32(code: u32) -> ErrorKind {
    match code {
        win32::ERROR_FILE_NOT_FOUND | win32::ERROR_PATH_NOT_FOUND | win32::WSAHOST_NOT_FOUND => {
            ErrorKind::NotFound
        }
        win32::ERROR_ACCESS_DENIED
        | win32::ERROR_NOACCESS
        | win32::WSAEACCES
        | win32::ERROR_SHARING_VIOLATION => ErrorKind::AccessDenied,
        win32::ERROR_ALREADY_EXISTS | win32::ERROR_FILE_EXISTS => ErrorKind::AlreadyExists,
        win32::ERROR_INVALID_DATA
        | win32::WSAEINVAL
        | win32::ERROR_INSUFFICIENT_BUFFER
        | win32::ERROR_INVALID_PARAMETER
        | win32::ERROR_NO_UNICODE_TRANSLATION => ErrorKind::InvalidArgument,
        win32::ERROR_OUTOFMEMORY | win32::ERROR_NOT_ENOUGH_MEMORY => ErrorKind::OutOfMemory,
        win32::ERROR_NETNAME_DELETED | win32::WSAECONNRESET => ErrorKind::ConnectionReset,
        win32::ERROR_CONNECTION_ABORTED | win32::WSAECONNABORTED => ErrorKind::ConnectionAborted,
        win32::ERROR_SEM_TIMEOUT => ErrorKind::TimedOut,
        win32::ERROR_NOT_SUPPORTED => ErrorKind::Unsupported,
        win32::ERROR_BROKEN_PIPE | win32::ERROR_HANDLE_EOF => ErrorKind::EndOfStream,
        win32::ERROR_INVALID_HANDLE | win32::ERROR_INVALID_FLAGS => ErrorKind::BadHandle,
        _ => ErrorKind::Unknown,
    }
}

mod win32 {
    pub(super) const ERROR_FILE_NOT_FOUND: u32 = 2;
    pub(super) const ERROR_PATH_NOT_FOUND: u32 = 3;
    pub(super) const ERROR_ACCESS_DENIED: u32 = 5;
    pub(super) const ERROR_INVALID_HANDLE: u32 = 6;
    pub(super) const ERROR_NOT_ENOUGH_MEMORY: u32 = 8;
    pub(super) const ERROR_INVALID_DATA: u32 = 13;
    pub(super) const ERROR_OUTOFMEMORY: u32 = 14;
    pub(super) const ERROR_SHARING_VIOLATION: u32 = 32;
    pub(super) const ERROR_HANDLE_EOF: u32 = 38;
    pub(super) const ERROR_NOT_SUPPORTED: u32 = 50;
    pub(super) const ERROR_NETNAME_DELETED: u32 = 64;
    pub(super) const ERROR_FILE_EXISTS: u32 = 80;
    pub(super) const ERROR_INVALID_PARAMETER: u32 = 87;
    pub(super) const ERROR_BROKEN_PIPE: u32 = 109;
    pub(super) const ERROR_SEM_TIMEOUT: u32 = 121;
    pub(super) const ERROR_INSUFFICIENT_BUFFER: u32 = 122;
    pub(super) const ERROR_ALREADY_EXISTS: u32 = 183;
    pub(super) const ERROR_NOACCESS: u32 = 998;
    pub(super) const ERROR_INVALID_FLAGS: u32 = 1004;
    pub(super) const ERROR_NO_UNICODE_TRANSLATION: u32 = 1113;
    pub(super) const ERROR_CONNECTION_ABORTED: u32 = 1236;
    pub(super) const WSAEACCES: u32 = 10013;
    pub(super) const WSAEINVAL: u32 = 10022;
    pub(super) const WSAECONNABORTED: u32 = 10053;
    pub(super) const WSAECONNRESET: u32 = 10054;
    pub(super) const WSAHOST_NOT_FOUND: u32 = 11001;
}
