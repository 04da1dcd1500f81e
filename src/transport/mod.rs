//! Transport capability.
//!
//! The pool never frames bytes or negotiates handshakes itself. It drives
//! already-opened streaming handles through the [`Transport`] and
//! [`TransportHandle`] traits.
//!
//! # Contract
//!
//! | Operation | Outcome |
//! |-----------|---------|
//! | [`Transport::open`] | handle, or [`Error::Connection`] |
//! | [`TransportHandle::send`] | bytes accepted, [`Error::WouldBlock`], or error |
//! | [`TransportHandle::recv`] | [`Received`], [`Error::WouldBlock`], or error |
//! | [`TransportHandle::close`] | consumes the handle |
//! | [`TransportHandle::descriptor`] | pollable descriptor, if any |
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `websocket` | `ws://` client transport on top of tungstenite |
//!
//! [`Error::Connection`]: crate::Error::Connection
//! [`Error::WouldBlock`]: crate::Error::WouldBlock

// ============================================================================
// Submodules
// ============================================================================

/// WebSocket client transport.
pub mod websocket;

/// Scripted transport and readiness for deterministic poller tests.
#[cfg(test)]
pub(crate) mod scripted;

// ============================================================================
// Imports
// ============================================================================

use std::os::fd::RawFd;

use serde::{Deserialize, Serialize};

use crate::error::Result;

// ============================================================================
// Re-exports
// ============================================================================

pub use websocket::WebSocketTransport;

// ============================================================================
// Types
// ============================================================================

/// Pollable descriptor a poller waits on.
pub type Descriptor = RawFd;

/// Kind of message being sent.
///
/// Passed through to the transport unchanged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    /// UTF-8 text message.
    Text,
    /// Opaque binary message.
    #[default]
    Binary,
}

/// Outcome of a successful non-blocking receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Received {
    /// Bytes written into the caller's buffer.
    pub len: usize,
    /// `true` once the logical message has been fully delivered.
    pub complete: bool,
}

impl Received {
    /// A chunk that ends the current message.
    #[inline]
    #[must_use]
    pub const fn complete(len: usize) -> Self {
        Self {
            len,
            complete: true,
        }
    }

    /// A chunk with more of the current message still pending.
    #[inline]
    #[must_use]
    pub const fn partial(len: usize) -> Self {
        Self {
            len,
            complete: false,
        }
    }
}

// ============================================================================
// Traits
// ============================================================================

/// Factory for transport handles.
///
/// Shared by every thread using the pool.
pub trait Transport: Send + Sync + 'static {
    /// Opens a connection to `target`.
    ///
    /// Blocks for the duration of the handshake. Implementations release
    /// anything partially opened before returning an error.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Connection`] (or any transport-specific error)
    /// when the connection cannot be established.
    fn open(&self, target: &str) -> Result<Box<dyn TransportHandle>>;
}

/// One open streaming connection.
///
/// All I/O methods are non-blocking and report lack of progress with
/// [`crate::Error::WouldBlock`].
pub trait TransportHandle: Send + 'static {
    /// Sends as much of `data` as the transport accepts right now.
    ///
    /// Returns the number of bytes accepted.
    fn send(&mut self, data: &[u8], kind: MessageKind) -> Result<usize>;

    /// Receives the next chunk of the current logical message into `buf`.
    fn recv(&mut self, buf: &mut [u8]) -> Result<Received>;

    /// Returns the descriptor to poll for readability.
    fn descriptor(&self) -> Option<Descriptor>;

    /// Returns `true` if received data is held in memory.
    ///
    /// Such data will not make the descriptor readable again, so the poller
    /// treats the handle as ready without waiting.
    fn has_buffered(&self) -> bool {
        false
    }

    /// Returns `true` if outgoing data is waiting for room in the socket.
    ///
    /// The poller then also waits for the descriptor to become writable and
    /// calls `recv`, which must push the pending output before reading.
    fn wants_write(&self) -> bool {
        false
    }

    /// Closes the connection and releases its resources.
    fn close(self: Box<Self>);
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_received_constructors() {
        assert_eq!(
            Received::complete(5),
            Received {
                len: 5,
                complete: true
            }
        );
        assert!(!Received::partial(5).complete);
    }

    #[test]
    fn test_message_kind_serde() {
        let json = serde_json::to_string(&MessageKind::Text).expect("serialize");
        assert_eq!(json, "\"text\"");
        let kind: MessageKind = serde_json::from_str("\"binary\"").expect("deserialize");
        assert_eq!(kind, MessageKind::Binary);
    }
}
