//! Readiness primitive the poller waits on.
//!
//! [`PollReadiness`] wraps `poll(2)`. The poller rebuilds the interest
//! list every cycle, so the primitive keeps no registration state and a
//! descriptor number reused by the OS can never be confused with a stale
//! registration.
//!
//! Every descriptor is watched for input. A handle with output stuck in a
//! user-space buffer also asks for writability, so the poller sleeps until
//! the kernel can take more instead of retrying the flush in a loop.

// ============================================================================
// Imports
// ============================================================================

use std::io;
use std::time::Duration;

use crate::transport::Descriptor;

// ============================================================================
// Interest
// ============================================================================

/// What the poller wants to hear about one descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest {
    /// Descriptor to watch.
    pub descriptor: Descriptor,
    /// Also report the descriptor when it becomes writable.
    pub writable: bool,
}

impl Interest {
    /// Input only.
    #[inline]
    #[must_use]
    pub const fn readable(descriptor: Descriptor) -> Self {
        Self {
            descriptor,
            writable: false,
        }
    }

    /// Input, plus room to write.
    #[inline]
    #[must_use]
    pub const fn read_write(descriptor: Descriptor) -> Self {
        Self {
            descriptor,
            writable: true,
        }
    }
}

// ============================================================================
// Readiness
// ============================================================================

/// Waits for any of a set of descriptors to become ready.
pub trait Readiness: Send + Sync + 'static {
    /// Blocks until an interest is satisfied or `timeout` elapses.
    ///
    /// `ready` has the same length as `interests`; entry `i` is set to
    /// `true` if `interests[i]` is readable (or hung up, or in error), or
    /// writable when it asked for that. Returns the number of ready entries.
    ///
    /// # Errors
    ///
    /// An error means the primitive itself failed; the poller treats it as
    /// fatal to every registered connection.
    fn wait(
        &self,
        interests: &[Interest],
        timeout: Duration,
        ready: &mut [bool],
    ) -> io::Result<usize>;
}

// ============================================================================
// PollReadiness
// ============================================================================

/// `poll(2)` based readiness.
#[derive(Debug, Default, Clone, Copy)]
pub struct PollReadiness;

impl PollReadiness {
    /// Events that make a descriptor worth servicing. `POLLOUT` is only
    /// reported when it was asked for.
    const READY_EVENTS: libc::c_short =
        libc::POLLIN | libc::POLLOUT | libc::POLLHUP | libc::POLLERR | libc::POLLNVAL;

    /// Creates the readiness primitive.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Rounds up to whole milliseconds so short timeouts do not spin.
    fn timeout_ms(timeout: Duration) -> libc::c_int {
        let ms = timeout.as_micros().div_ceil(1000);
        libc::c_int::try_from(ms).unwrap_or(libc::c_int::MAX)
    }
}

impl Readiness for PollReadiness {
    fn wait(
        &self,
        interests: &[Interest],
        timeout: Duration,
        ready: &mut [bool],
    ) -> io::Result<usize> {
        let mut fds: Vec<libc::pollfd> = interests
            .iter()
            .map(|interest| libc::pollfd {
                fd: interest.descriptor,
                events: if interest.writable {
                    libc::POLLIN | libc::POLLOUT
                } else {
                    libc::POLLIN
                },
                revents: 0,
            })
            .collect();

        let nfds = libc::nfds_t::try_from(fds.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "too many descriptors"))?;

        // SAFETY: `fds` is a live, exclusively borrowed array of `nfds` entries.
        let n = unsafe { libc::poll(fds.as_mut_ptr(), nfds, Self::timeout_ms(timeout)) };

        if n < 0 {
            let err = io::Error::last_os_error();
            // EINTR is not a failure of the primitive, just an empty cycle
            if err.kind() == io::ErrorKind::Interrupted {
                ready.fill(false);
                return Ok(0);
            }
            return Err(err);
        }

        let mut count = 0;
        for (slot, fd) in ready.iter_mut().zip(&fds) {
            *slot = fd.revents & Self::READY_EVENTS != 0;
            count += usize::from(*slot);
        }
        Ok(count)
    }
}

// ============================================================================
// Tests
// ============================================================================
