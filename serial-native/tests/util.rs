#![cfg(target_os = "linux")]

use std::ffi::CStr;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serial_native::binding::SerialPort;
use serial_native::{Dispatcher, EventLoop};

/// Run `f` against a fresh loop, then deliver whatever it left in flight.
#[allow(dead_code)]
pub fn with_test_env<U, F>(f: F) -> Result<U, Box<dyn std::error::Error>>
where
    F: FnOnce(&SerialPort) -> Result<U, Box<dyn std::error::Error>>,
{
    let _ = env_logger::builder()
        .filter_level(log::LevelFilter::Trace)
        .is_test(true)
        .try_init();

    let event_loop = EventLoop::new()?;
    let port = SerialPort::new(Dispatcher::new(&event_loop));
    let out = f(&port)?;
    port.dispatcher().run()?;
    Ok(out)
}

fn cvt(res: libc::c_int) -> io::Result<libc::c_int> {
    if res == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(res)
}

/// A pseudo-terminal pair. The follower side behaves like a serial device
/// and is what the tests open; the leader side is kept here to observe and
/// inject traffic.
#[derive(Debug)]
pub struct Pty {
    leader: File,
    path: PathBuf,
}

impl Pty {
    pub fn open() -> io::Result<Self> {
        let fd = cvt(unsafe { libc::posix_openpt(libc::O_RDWR | libc::O_NOCTTY) })?;
        let leader = unsafe { File::from_raw_fd(fd) };
        cvt(unsafe { libc::grantpt(fd) })?;
        cvt(unsafe { libc::unlockpt(fd) })?;

        let mut name = [0 as libc::c_char; 128];
        let res = unsafe { libc::ptsname_r(fd, name.as_mut_ptr(), name.len()) };
        if res != 0 {
            return Err(io::Error::from_raw_os_error(res));
        }
        let name = unsafe { CStr::from_ptr(name.as_ptr()) };
        let path = PathBuf::from(name.to_str().map_err(|err| {
            io::Error::new(io::ErrorKind::InvalidData, err)
        })?);
        Ok(Self { leader, path })
    }

    /// Path of the follower device.
    #[allow(dead_code)]
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn path_str(&self) -> &str {
        self.path.to_str().expect("pty path is utf-8")
    }

    /// Send bytes towards the follower.
    #[allow(dead_code)]
    pub fn inject(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.leader.write_all(bytes)
    }

    /// Collect exactly `len` bytes written by the follower, or time out.
    #[allow(dead_code)]
    pub fn collect(&mut self, len: usize) -> io::Result<Vec<u8>> {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut out = Vec::with_capacity(len);
        let mut chunk = [0u8; 256];
        while out.len() < len {
            let mut pfd = libc::pollfd {
                fd: self.leader.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            };
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(io::ErrorKind::TimedOut.into());
            }
            cvt(unsafe { libc::poll(&mut pfd, 1, remaining.as_millis() as libc::c_int) })?;
            if pfd.revents & libc::POLLIN == 0 {
                continue;
            }
            let want = (len - out.len()).min(chunk.len());
            let n = self.leader.read(&mut chunk[..want])?;
            out.extend_from_slice(&chunk[..n]);
        }
        Ok(out)
    }
}
