//! Builder pattern for pool configuration.
//!
//! Provides a fluent API for swapping the transport, the readiness
//! primitive and the options of a [`ConnectionPool`].
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use wsmux::{ConnectionPool, PoolOptions};
//!
//! # fn example() -> wsmux::Result<()> {
//! let pool = ConnectionPool::builder()
//!     .options(PoolOptions::new().with_poll_timeout(Duration::from_millis(20)))
//!     .build()?;
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

use crate::error::Result;
use crate::transport::{Transport, WebSocketTransport};

use super::core::ConnectionPool;
use super::options::PoolOptions;
use super::readiness::{PollReadiness, Readiness};

// ============================================================================
// ConnectionPoolBuilder
// ============================================================================

/// Builder for configuring a [`ConnectionPool`].
///
/// Use [`ConnectionPool::builder()`] to create a new builder. Anything left
/// unset falls back to the WebSocket transport, `poll(2)` readiness and
/// default options.
#[derive(Default)]
pub struct ConnectionPoolBuilder {
    transport: Option<Arc<dyn Transport>>,
    readiness: Option<Arc<dyn Readiness>>,
    options: Option<PoolOptions>,
}

impl ConnectionPoolBuilder {
    /// Creates a builder with nothing set.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the transport used to open connections.
    #[must_use]
    pub fn transport(self, transport: impl Transport) -> Self {
        self.transport_arc(Arc::new(transport))
    }

    /// Sets a shared transport.
    #[must_use]
    pub fn transport_arc(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Sets the readiness primitive the poller waits on.
    #[must_use]
    pub fn readiness(self, readiness: impl Readiness) -> Self {
        self.readiness_arc(Arc::new(readiness))
    }

    /// Sets a shared readiness primitive.
    #[must_use]
    pub fn readiness_arc(mut self, readiness: Arc<dyn Readiness>) -> Self {
        self.readiness = Some(readiness);
        self
    }

    /// Sets the pool options.
    #[must_use]
    pub fn options(mut self, options: PoolOptions) -> Self {
        self.options = Some(options);
        self
    }

    /// Builds the pool.
    ///
    /// The default transport picks up `connect_timeout` from the options.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`](crate::Error::InvalidArgument) if
    /// the options fail validation.
    pub fn build(self) -> Result<Arc<ConnectionPool>> {
        let options = self.options.unwrap_or_default();
        options.validate()?;

        let transport = self.transport.unwrap_or_else(|| {
            Arc::new(WebSocketTransport::new().with_connect_timeout(options.connect_timeout))
        });
        let readiness = self
            .readiness
            .unwrap_or_else(|| Arc::new(PollReadiness::new()));

        Ok(ConnectionPool::from_parts(transport, readiness, options))
    }
}

impl fmt::Debug for ConnectionPoolBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPoolBuilder")
            .field("transport", &self.transport.is_some())
            .field("readiness", &self.readiness.is_some())
            .field("options", &self.options)
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
