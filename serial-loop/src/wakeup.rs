//! Cross-thread wakeup for a parked event loop.
//!
//! The loop sleeps in `poll(2)` on a descriptor. A worker that posts a
//! completion writes to that descriptor only if the loop has said it is
//! going to sleep, so a busy loop never pays for the syscall.
//!
//! Linux uses an eventfd. Other unix platforms use a non-blocking pipe.
use std::fmt;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use log::{trace, warn};

use crate::park::ParkMode;

const LOG: &str = "serial_loop::wakeup";

/// The loop is about to poll, or is polling. Only the loop sets it.
const SLEEPING: u8 = 0b01;
/// A worker asked the loop to wake. The worker whose `fetch_or` set it
/// does the descriptor write.
const SIGNALLED: u8 = 0b10;

/// Snapshot of the flag word.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct Flags(u8);

impl Flags {
    pub(crate) fn sleeping(self) -> bool {
        self.0 & SLEEPING != 0
    }

    pub(crate) fn signalled(self) -> bool {
        self.0 & SIGNALLED != 0
    }
}

impl fmt::Debug for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Flags(sleeping={}, signalled={})",
            self.sleeping(),
            self.signalled()
        )
    }
}

/// Handle to one loop's wakeup descriptor. Clones share it.
#[derive(Clone)]
pub(crate) struct Wakeup {
    shared: Arc<Channel>,
}

struct Channel {
    flags: AtomicU8,
    /// Polled and drained by the loop.
    read_end: File,
    /// Written by workers. `None` for an eventfd, whose single descriptor
    /// is used both ways.
    write_end: Option<File>,
}

impl fmt::Debug for Wakeup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Wakeup")
            .field("fd", &self.shared.read_end.as_raw_fd())
            .field("flags", &self.flags())
            .finish()
    }
}

fn check(res: libc::c_int) -> io::Result<libc::c_int> {
    if res == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(res)
}

impl Wakeup {
    #[cfg(target_os = "linux")]
    pub(crate) fn new() -> io::Result<Wakeup> {
        let fd = check(unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) })?;
        // Safety: the descriptor is fresh and owned by nothing else.
        let read_end = unsafe { File::from_raw_fd(fd) };
        Ok(Self::with_ends(read_end, None))
    }

    #[cfg(not(target_os = "linux"))]
    pub(crate) fn new() -> io::Result<Wakeup> {
        let mut fds = [0 as libc::c_int; 2];
        check(unsafe { libc::pipe(fds.as_mut_ptr()) })?;
        // Safety: both descriptors are fresh and owned by nothing else.
        let (read_end, write_end) =
            unsafe { (File::from_raw_fd(fds[0]), File::from_raw_fd(fds[1])) };
        for fd in fds {
            let status = check(unsafe { libc::fcntl(fd, libc::F_GETFL) })?;
            check(unsafe { libc::fcntl(fd, libc::F_SETFL, status | libc::O_NONBLOCK) })?;
            check(unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) })?;
        }
        Ok(Self::with_ends(read_end, Some(write_end)))
    }

    fn with_ends(read_end: File, write_end: Option<File>) -> Wakeup {
        Wakeup {
            shared: Arc::new(Channel {
                flags: AtomicU8::new(0),
                read_end,
                write_end,
            }),
        }
    }

    pub(crate) fn flags(&self) -> Flags {
        Flags(self.shared.flags.load(Ordering::Acquire))
    }

    /// Announce that the loop is going to sleep. Returns the flags from
    /// before the announcement; if a worker already signalled, the loop
    /// must not poll.
    pub(crate) fn announce_sleep(&self) -> Flags {
        Flags(self.shared.flags.fetch_or(SLEEPING, Ordering::AcqRel))
    }

    /// Forget both the sleep announcement and any signal.
    pub(crate) fn clear(&self) {
        self.shared
            .flags
            .fetch_and(!(SLEEPING | SIGNALLED), Ordering::Release);
    }

    /// Block the loop thread until a worker signals or `mode` elapses.
    pub(crate) fn wait(&self, mode: ParkMode) -> io::Result<()> {
        if mode == ParkMode::NoPark {
            return Ok(());
        }
        if !self.announce_sleep().signalled() {
            trace!(target: LOG, "wait.poll {:?}", mode);
            let mut pollfd = libc::pollfd {
                fd: self.shared.read_end.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            };
            if let Err(err) = check(unsafe { libc::poll(&mut pollfd, 1, mode.poll_timeout()) }) {
                if err.kind() != io::ErrorKind::Interrupted {
                    self.clear();
                    return Err(err);
                }
            }
        }
        self.drain_descriptor();
        self.clear();
        Ok(())
    }

    fn drain_descriptor(&self) {
        let mut scratch = [0u8; 64];
        let single_read = self.shared.write_end.is_none();
        loop {
            match (&self.shared.read_end).read(&mut scratch) {
                Ok(0) => return,
                // One eventfd read resets the whole counter.
                Ok(_) if single_read => return,
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    warn!(target: LOG, "drain.failed: {}", err);
                    return;
                }
            }
        }
    }

    /// Called by a worker after it posted. Writes only if the loop sleeps
    /// and no other worker has written since the loop last woke.
    pub(crate) fn signal(&self) {
        let before = Flags(self.shared.flags.fetch_or(SIGNALLED, Ordering::AcqRel));
        if before.signalled() || !before.sleeping() {
            return;
        }
        let mut target = self.shared.write_end.as_ref().unwrap_or(&self.shared.read_end);
        match target.write(&1u64.to_ne_bytes()) {
            Ok(_) => {}
            // A full pipe or saturated counter is already readable.
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => warn!(target: LOG, "signal.failed: {}", err),
        }
    }
}

impl AsRawFd for Wakeup {
    fn as_raw_fd(&self) -> RawFd {
        self.shared.read_end.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::{Duration, Instant};

    use super::*;

    #[test]
    fn flag_transitions() {
        let wakeup = Wakeup::new().unwrap();
        assert_eq!(wakeup.announce_sleep(), Flags(0));
        assert!(wakeup.flags().sleeping());

        wakeup.signal();
        let flags = wakeup.flags();
        assert!(flags.sleeping() && flags.signalled());

        wakeup.clear();
        assert_eq!(wakeup.flags(), Flags(0));
    }

    #[test]
    fn early_signal_skips_poll() {
        let wakeup = Wakeup::new().unwrap();
        wakeup.signal();
        let started = Instant::now();
        wakeup.wait(ParkMode::Timeout(Duration::from_secs(10))).unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(wakeup.flags(), Flags(0));
    }

    #[test]
    fn signal_from_worker() {
        let wakeup = Wakeup::new().unwrap();
        let remote = wakeup.clone();
        let worker = thread::spawn(move || {
            while !remote.flags().sleeping() {
                thread::yield_now();
            }
            remote.signal();
        });
        wakeup.wait(ParkMode::NextCompletion).unwrap();
        worker.join().unwrap();
        assert!(!wakeup.flags().sleeping());
    }

    #[test]
    fn timeout_without_signal() {
        let wakeup = Wakeup::new().unwrap();
        let started = Instant::now();
        wakeup.wait(ParkMode::Timeout(Duration::from_millis(20))).unwrap();
        assert!(started.elapsed() >= Duration::from_millis(20));
    }
}
