//! Connection pool module.
//!
//! Owns open connections and multiplexes their receive side on one
//! background poller thread.
//!
//! # Components
//!
//! | Type | Description |
//! |------|-------------|
//! | [`ConnectionPool`] | Registration, lifecycle and introspection |
//! | [`ConnectionPoolBuilder`] | Fluent configuration builder |
//! | [`Connection`] | Clonable handle to one connection |
//! | [`Callbacks`] | Open, close and message callbacks |
//! | [`PoolOptions`] | Poll timeout, buffers, send retry |
//! | [`Readiness`] | Readiness primitive the poller waits on |
//! | [`Interest`] | Descriptor plus read/write interest |
//!
//! # Threads
//!
//! The poller thread is started by the first [`ConnectionPool::listen`]
//! and exits once no connection is registered. Message callbacks always
//! run on it; open and close callbacks run on the thread that caused them.

// ============================================================================
// Submodules
// ============================================================================

/// Fluent builder pattern for pool configuration.
pub mod builder;

/// Connection handle and callbacks.
pub mod connection;

/// Core pool implementation.
pub mod core;

/// Pool options.
pub mod options;

/// Readiness primitive.
pub mod readiness;

mod poller;
mod reassembly;
mod registry;

// ============================================================================
// Re-exports
// ============================================================================

pub use builder::ConnectionPoolBuilder;
pub use connection::{Callbacks, Connection, ConnectionHandler, MessageHandler};
pub use core::ConnectionPool;
pub use options::{PoolOptions, ReassemblyPolicy};
pub use readiness::{Interest, PollReadiness, Readiness};
