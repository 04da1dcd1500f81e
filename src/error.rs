//! Error types for wsmux.
//!
//! This module defines all error types used throughout the crate.
//!
//! # Usage
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```ignore
//! use wsmux::{Callbacks, ConnectionPool, MessageKind, Result};
//!
//! fn example(pool: &ConnectionPool, callbacks: Callbacks) -> Result<()> {
//!     let connection = pool.start("ws://127.0.0.1:9001", callbacks)?;
//!     connection.send(b"hello", MessageKind::Text)?;
//!     Ok(())
//! }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Argument | [`Error::InvalidArgument`], [`Error::AlreadyRegistered`], [`Error::NoDescriptor`] |
//! | Connection | [`Error::Connection`], [`Error::ConnectionClosed`] |
//! | Transport | [`Error::Transport`], [`Error::WouldBlock`], [`Error::SendStalled`] |
//! | Poller | [`Error::Poll`], [`Error::Allocation`] |
//! | External | [`Error::Io`], [`Error::WebSocket`], [`Error::Url`] |

// ============================================================================
// Imports
// ============================================================================

use std::io::{Error as IoError, ErrorKind};
use std::result::Result as StdResult;

use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;
use url::ParseError as UrlError;

use crate::identifiers::ConnectionId;

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
///
/// All fallible operations in this crate return this type.
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
///
/// Each variant includes relevant context for debugging.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Argument Errors
    // ========================================================================
    /// Invalid argument passed to an API call.
    ///
    /// Returned when a precondition such as a non-empty target,
    /// a message callback or a non-empty send buffer is not met.
    #[error("Invalid argument: {message}")]
    InvalidArgument {
        /// Description of the invalid argument.
        message: String,
    },

    /// Connection is already registered with the poller.
    #[error("Connection {connection_id} is already registered")]
    AlreadyRegistered {
        /// The connection that was registered twice.
        connection_id: ConnectionId,
    },

    /// Transport handle cannot produce a pollable descriptor.
    #[error("Connection {connection_id} has no pollable descriptor")]
    NoDescriptor {
        /// The connection without a descriptor.
        connection_id: ConnectionId,
    },

    // ========================================================================
    // Connection Errors
    // ========================================================================
    /// Transport open or handshake failed.
    ///
    /// Returned by connect. No state is created and nothing is retried.
    #[error("Connection to {target} failed: {message}")]
    Connection {
        /// Target the connection was attempted against.
        target: String,
        /// Reason reported by the transport.
        message: String,
    },

    /// Connection is closed.
    ///
    /// Returned when operating on a connection whose handle was released,
    /// and by transports when the peer closes the stream.
    #[error("Connection closed")]
    ConnectionClosed,

    // ========================================================================
    // Transport Errors
    // ========================================================================
    /// Send or receive failed on a live connection.
    ///
    /// Fatal to that connection only.
    #[error("Transport error on connection {connection_id}: {message}")]
    Transport {
        /// The connection the failure occurred on.
        connection_id: ConnectionId,
        /// Description of the failure.
        message: String,
    },

    /// Non-blocking operation cannot make progress right now.
    #[error("Operation would block")]
    WouldBlock,

    /// Send gave up after the transport kept refusing data.
    #[error("Send stalled after {attempts} attempts")]
    SendStalled {
        /// Number of consecutive attempts that made no progress.
        attempts: u32,
    },

    // ========================================================================
    // Poller Errors
    // ========================================================================
    /// The multiplexing primitive itself failed.
    ///
    /// Every registered connection is evicted when this happens.
    #[error("Poll error: {message}")]
    Poll {
        /// Description of the failure.
        message: String,
    },

    /// Buffer or registry growth failed.
    #[error("Allocation of {requested} bytes failed")]
    Allocation {
        /// Number of bytes (or slots) that could not be reserved.
        requested: usize,
    },

    // ========================================================================
    // External Errors
    // ========================================================================
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] IoError),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    /// Target URL could not be parsed.
    #[error("URL error: {0}")]
    Url(#[from] UrlError),
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates an invalid argument error.
    #[inline]
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Creates an already registered error.
    #[inline]
    pub fn already_registered(connection_id: ConnectionId) -> Self {
        Self::AlreadyRegistered { connection_id }
    }

    /// Creates a missing descriptor error.
    #[inline]
    pub fn no_descriptor(connection_id: ConnectionId) -> Self {
        Self::NoDescriptor { connection_id }
    }

    /// Creates a connection error.
    #[inline]
    pub fn connection(target: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Connection {
            target: target.into(),
            message: message.into(),
        }
    }

    /// Creates a transport error.
    #[inline]
    pub fn transport(connection_id: ConnectionId, message: impl Into<String>) -> Self {
        Self::Transport {
            connection_id,
            message: message.into(),
        }
    }

    /// Creates a send stalled error.
    #[inline]
    pub fn send_stalled(attempts: u32) -> Self {
        Self::SendStalled { attempts }
    }

    /// Creates a poll error.
    #[inline]
    pub fn poll(message: impl Into<String>) -> Self {
        Self::Poll {
            message: message.into(),
        }
    }

    /// Creates an allocation error.
    #[inline]
    pub fn allocation(requested: usize) -> Self {
        Self::Allocation { requested }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if the operation should simply be retried later.
    ///
    /// Covers [`Error::WouldBlock`] as well as IO and WebSocket errors
    /// wrapping [`ErrorKind::WouldBlock`].
    #[inline]
    #[must_use]
    pub fn is_would_block(&self) -> bool {
        match self {
            Self::WouldBlock => true,
            Self::Io(e) => e.kind() == ErrorKind::WouldBlock,
            Self::WebSocket(WsError::Io(e)) => e.kind() == ErrorKind::WouldBlock,
            _ => false,
        }
    }

    /// Returns `true` if this is a connection error.
    #[inline]
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. }
                | Self::ConnectionClosed
                | Self::WebSocket(WsError::ConnectionClosed | WsError::AlreadyClosed)
        )
    }

    /// Returns `true` if this error ends the connection it occurred on.
    ///
    /// Would-block and allocation failures leave the connection usable.
    #[inline]
    #[must_use]
    pub fn is_fatal_to_connection(&self) -> bool {
        !self.is_would_block() && !matches!(self, Self::Allocation { .. })
    }
}

// ============================================================================
// Tests
// ============================================================================
