//! Contains [`ParkMode`], which controls how long an [`EventLoop`]
//! may block waiting for completions.
//!
//! [`EventLoop`]: crate::EventLoop
use std::time::Duration;

/// Indicates under what conditions a park operation
/// should return.
///
/// Note it is always valid to return from a park operation
/// early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParkMode {
    /// The park operation should return immediately.
    NoPark,

    /// The park operation should return once at least one
    /// completion has been posted to the loop.
    NextCompletion,

    /// The park operation should return before the
    /// specified duration has elapsed.
    Timeout(Duration),
}

impl ParkMode {
    /// Returns the timeout to pass to `poll(2)`, `-1` meaning forever.
    pub(crate) fn poll_timeout(self) -> libc::c_int {
        match self {
            ParkMode::NoPark => 0,
            ParkMode::NextCompletion => -1,
            ParkMode::Timeout(duration) => {
                // Round up so a sub-millisecond timeout still sleeps.
                let millis = duration.as_nanos().div_ceil(1_000_000);
                libc::c_int::try_from(millis).unwrap_or(libc::c_int::MAX)
            }
        }
    }
}
