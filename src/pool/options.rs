//! Pool configuration.
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use wsmux::{PoolOptions, ReassemblyPolicy};
//!
//! let options = PoolOptions::new()
//!     .with_poll_timeout(Duration::from_millis(50))
//!     .with_initial_buffer_capacity(16 * 1024)
//!     .with_reassembly_policy(ReassemblyPolicy::Discard);
//! ```
//!
//! Options can also be loaded from any serde format; missing fields take
//! their defaults.

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::transport::websocket::DEFAULT_CONNECT_TIMEOUT;

// ============================================================================
// Constants
// ============================================================================

/// Upper bound on one readiness wait.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Initial capacity of a reassembly buffer.
pub const DEFAULT_INITIAL_BUFFER_CAPACITY: usize = 4096;

/// Largest accepted initial reassembly buffer capacity.
pub const MAX_INITIAL_BUFFER_CAPACITY: usize = 64 * 1024 * 1024;

/// Consecutive no-progress send attempts before giving up.
pub const DEFAULT_SEND_RETRY_LIMIT: u32 = 1000;

/// Base delay between no-progress send attempts.
pub const DEFAULT_SEND_BACKOFF: Duration = Duration::from_micros(50);

/// Cap on the delay between send attempts.
pub const MAX_SEND_BACKOFF: Duration = Duration::from_millis(10);

/// Default name of the poller thread.
pub const DEFAULT_THREAD_NAME: &str = "wsmux-poller";

// ============================================================================
// ReassemblyPolicy
// ============================================================================

/// What happens to a partially received message when the transport runs
/// dry before the message completes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReassemblyPolicy {
    /// Keep the received prefix and continue on the next readable event.
    #[default]
    Retain,
    /// Drop the received prefix. Later chunks of that message are then
    /// delivered as if they started a new one.
    Discard,
}

// ============================================================================
// PoolOptions
// ============================================================================

/// Connection pool configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolOptions {
    /// Upper bound on one readiness wait.
    ///
    /// Also bounds how long a membership change waits before the poller
    /// observes it.
    pub poll_timeout: Duration,

    /// Initial reassembly buffer capacity in bytes.
    pub initial_buffer_capacity: usize,

    /// Handling of partial messages across readable events.
    pub reassembly_policy: ReassemblyPolicy,

    /// Consecutive no-progress send attempts before [`Error::SendStalled`].
    pub send_retry_limit: u32,

    /// Base delay between no-progress send attempts, grown linearly.
    pub send_backoff: Duration,

    /// Connect and handshake timeout for the default transport.
    pub connect_timeout: Duration,

    /// Name given to the poller thread.
    pub thread_name: String,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Constructors
// ============================================================================

impl PoolOptions {
    /// Creates options with default settings.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self {
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            initial_buffer_capacity: DEFAULT_INITIAL_BUFFER_CAPACITY,
            reassembly_policy: ReassemblyPolicy::Retain,
            send_retry_limit: DEFAULT_SEND_RETRY_LIMIT,
            send_backoff: DEFAULT_SEND_BACKOFF,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            thread_name: DEFAULT_THREAD_NAME.to_owned(),
        }
    }
}

// ============================================================================
// Builder Methods
// ============================================================================

impl PoolOptions {
    /// Sets the readiness wait bound.
    #[inline]
    #[must_use]
    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    /// Sets the initial reassembly buffer capacity.
    #[inline]
    #[must_use]
    pub fn with_initial_buffer_capacity(mut self, capacity: usize) -> Self {
        self.initial_buffer_capacity = capacity;
        self
    }

    /// Sets the partial message policy.
    #[inline]
    #[must_use]
    pub fn with_reassembly_policy(mut self, policy: ReassemblyPolicy) -> Self {
        self.reassembly_policy = policy;
        self
    }

    /// Sets the send retry limit and base backoff.
    #[inline]
    #[must_use]
    pub fn with_send_retry(mut self, limit: u32, backoff: Duration) -> Self {
        self.send_retry_limit = limit;
        self.send_backoff = backoff;
        self
    }

    /// Sets the connect and handshake timeout.
    #[inline]
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the poller thread name.
    #[inline]
    #[must_use]
    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }
}

// ============================================================================
// Validation
// ============================================================================

impl PoolOptions {
    /// Checks that the options describe a usable pool.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] for a zero poll timeout, a buffer
    /// capacity of zero or above [`MAX_INITIAL_BUFFER_CAPACITY`], a zero
    /// retry limit or an empty thread name.
    pub fn validate(&self) -> Result<()> {
        if self.poll_timeout.is_zero() {
            return Err(Error::invalid_argument("poll_timeout must be non-zero"));
        }
        if self.initial_buffer_capacity == 0 {
            return Err(Error::invalid_argument(
                "initial_buffer_capacity must be non-zero",
            ));
        }
        if self.initial_buffer_capacity > MAX_INITIAL_BUFFER_CAPACITY {
            return Err(Error::invalid_argument(format!(
                "initial_buffer_capacity must be at most {MAX_INITIAL_BUFFER_CAPACITY}"
            )));
        }
        if self.send_retry_limit == 0 {
            return Err(Error::invalid_argument("send_retry_limit must be non-zero"));
        }
        if self.thread_name.is_empty() {
            return Err(Error::invalid_argument("thread_name must not be empty"));
        }
        Ok(())
    }

    /// Delay before the `attempt`-th consecutive no-progress send retry.
    #[must_use]
    pub(crate) fn send_delay(&self, attempt: u32) -> Duration {
        self.send_backoff.saturating_mul(attempt).min(MAX_SEND_BACKOFF)
    }
}

// ============================================================================
// Tests
// ============================================================================
