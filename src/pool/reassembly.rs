//! Frame reassembly.
//!
//! Turns the transport's chunked receive contract into whole messages.
//! A message is only handed out once the transport marks it complete, so a
//! message callback never observes a partial payload.

// ============================================================================
// Imports
// ============================================================================

use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::transport::TransportHandle;

use super::options::{PoolOptions, ReassemblyPolicy};

// ============================================================================
// Reassembler
// ============================================================================

/// Reassembly settings shared by every slot of a poller.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Reassembler {
    initial_capacity: usize,
    policy: ReassemblyPolicy,
}

impl Reassembler {
    pub(crate) fn new(initial_capacity: usize, policy: ReassemblyPolicy) -> Self {
        Self {
            initial_capacity: initial_capacity.max(1),
            policy,
        }
    }

    pub(crate) fn from_options(options: &PoolOptions) -> Self {
        Self::new(options.initial_buffer_capacity, options.reassembly_policy)
    }

    /// Receives from `handle` until a message completes or data runs out.
    ///
    /// `partial` carries a retained prefix in and out. Returns
    /// `Ok(Some(message))` for a complete message and `Ok(None)` when the
    /// transport has nothing more right now.
    ///
    /// # Errors
    ///
    /// - [`Error::Allocation`] if the buffer cannot grow; the in-progress
    ///   message is dropped
    /// - any non-would-block transport error, unchanged
    pub(crate) fn pump(
        &self,
        handle: &mut dyn TransportHandle,
        partial: &mut Vec<u8>,
    ) -> Result<Option<Vec<u8>>> {
        let mut buffer = std::mem::take(partial);
        let mut filled = buffer.len();

        loop {
            if filled == buffer.len() {
                let additional = filled.max(self.initial_capacity);
                if buffer.try_reserve_exact(additional).is_err() {
                    return Err(Error::allocation(filled.saturating_add(additional)));
                }
                buffer.resize(filled + additional, 0);
            }

            let received = match handle.recv(&mut buffer[filled..]) {
                Ok(received) => received,
                Err(e) if e.is_would_block() => {
                    self.park(buffer, filled, partial);
                    return Ok(None);
                }
                Err(e) => return Err(e),
            };

            filled += received.len.min(buffer.len() - filled);

            if received.complete {
                buffer.truncate(filled);
                trace!(len = filled, "Message reassembled");
                return Ok(Some(buffer));
            }

            // No progress and not complete: the transport is out of data
            if received.len == 0 {
                self.park(buffer, filled, partial);
                return Ok(None);
            }
        }
    }

    /// Keeps or drops an unfinished prefix according to the policy.
    fn park(&self, mut buffer: Vec<u8>, filled: usize, partial: &mut Vec<u8>) {
        if filled == 0 {
            return;
        }

        match self.policy {
            ReassemblyPolicy::Retain => {
                buffer.truncate(filled);
                *partial = buffer;
            }
            ReassemblyPolicy::Discard => {
                debug!(dropped = filled, "Partial message discarded");
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
