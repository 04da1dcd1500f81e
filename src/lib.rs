//! wsmux - Multiplex many streaming connections on one poller thread.
//!
//! This library owns a set of client connections and services the receive
//! side of all of them from a single background thread, reassembling
//! fragmented messages before handing them to a callback.
//!
//! # Architecture
//!
//! The pool follows a single-owner model:
//!
//! - **Callers**: connect, register, send and close from any thread
//! - **Poller**: one thread owns the polling set, waits on every descriptor,
//!   reassembles and dispatches complete messages
//!
//! Key design principles:
//!
//! - The poller thread starts lazily on the first registration and exits
//!   when the last connection leaves
//! - Membership changes reach the poller as commands over a channel
//! - A transport failure evicts one connection; a readiness failure evicts
//!   all of them
//! - `on_close` fires at most once per connection
//!
//! # Quick Start
//!
//! ```no_run
//! use wsmux::{Callbacks, ConnectionPool, MessageKind, Result};
//!
//! fn main() -> Result<()> {
//!     let pool = ConnectionPool::new();
//!
//!     let connection = pool.start(
//!         "ws://127.0.0.1:9001/ticker",
//!         Callbacks::new()
//!             .on_open(|conn| println!("{} open", conn.id()))
//!             .on_message(|conn, data| println!("{}: {} bytes", conn.id(), data.len()))
//!             .on_close(|conn| println!("{} closed", conn.id())),
//!     )?;
//!
//!     connection.send(b"subscribe", MessageKind::Text)?;
//!
//!     // ...
//!     connection.close();
//!     pool.join_background_thread()?;
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`error`] | Error types and [`Result`] alias |
//! | [`identifiers`] | Connection identities |
//! | [`pool`] | Pool, connections, poller |
//! | [`transport`] | Transport capability and the WebSocket client |
//!
//! # Platform
//!
//! Readiness is built on `poll(2)`, so the crate targets Unix.

// ============================================================================
// Modules
// ============================================================================

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Type-safe connection identities.
pub mod identifiers;

/// Connection pool and background poller.
///
/// Use [`ConnectionPool::new()`] or [`ConnectionPool::builder()`] to create
/// a pool.
pub mod pool;

/// Transport capability.
///
/// The pool drives any [`Transport`]; [`WebSocketTransport`] is the default.
pub mod transport;

// ============================================================================
// Re-exports
// ============================================================================

// Error types
pub use error::{Error, Result};

// Identifier types
pub use identifiers::ConnectionId;

// Pool types
pub use pool::{
    Callbacks, Connection, ConnectionHandler, ConnectionPool, ConnectionPoolBuilder, Interest,
    MessageHandler, PollReadiness, PoolOptions, Readiness, ReassemblyPolicy,
};

// Transport types
pub use transport::{
    Descriptor, MessageKind, Received, Transport, TransportHandle, WebSocketTransport,
};
