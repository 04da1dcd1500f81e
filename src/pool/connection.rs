//! Connection handle and callbacks.
//!
//! A [`Connection`] is a cheap, clonable handle to one open transport
//! handle plus its callbacks. Clones share state, so a connection can be
//! sent and closed from any thread, including from inside its own
//! callbacks on the poller thread.
//!
//! # Lifecycle
//!
//! ```text
//! connect ──► open, unregistered ──listen──► registered ──close/evict──► closed
//!                      │                                                    ▲
//!                      └──────────────────────close─────────────────────────┘
//! ```
//!
//! Closing releases the transport handle exactly once. Whoever releases it
//! runs `on_close`, so the callback fires at most once per connection.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::identifiers::ConnectionId;
use crate::transport::{Descriptor, MessageKind, TransportHandle};

use super::core::ConnectionPool;
use super::options::PoolOptions;

// ============================================================================
// Types
// ============================================================================

/// Callback invoked when a connection opens or closes.
pub type ConnectionHandler = Box<dyn Fn(&Connection) + Send + Sync>;

/// Callback invoked with each complete message.
pub type MessageHandler = Box<dyn Fn(&Connection, &[u8]) + Send + Sync>;

// ============================================================================
// Callbacks
// ============================================================================

/// Callback set for one connection.
///
/// `on_message` is mandatory; connect rejects a set without it.
///
/// | Callback | Thread |
/// |----------|--------|
/// | `on_open` | caller of connect |
/// | `on_close` | whichever thread closed or evicted the connection |
/// | `on_message` | poller thread |
///
/// # Example
///
/// ```ignore
/// let callbacks = Callbacks::new()
///     .on_open(|conn| println!("{} open", conn.id()))
///     .on_message(|conn, data| println!("{}: {} bytes", conn.id(), data.len()))
///     .on_close(|conn| println!("{} closed", conn.id()));
/// ```
#[derive(Default)]
pub struct Callbacks {
    on_open: Option<ConnectionHandler>,
    on_close: Option<ConnectionHandler>,
    on_message: Option<MessageHandler>,
}

impl Callbacks {
    /// Creates an empty callback set.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the open callback.
    #[must_use]
    pub fn on_open(mut self, handler: impl Fn(&Connection) + Send + Sync + 'static) -> Self {
        self.on_open = Some(Box::new(handler));
        self
    }

    /// Sets the close callback.
    #[must_use]
    pub fn on_close(mut self, handler: impl Fn(&Connection) + Send + Sync + 'static) -> Self {
        self.on_close = Some(Box::new(handler));
        self
    }

    /// Sets the message callback.
    #[must_use]
    pub fn on_message(
        mut self,
        handler: impl Fn(&Connection, &[u8]) + Send + Sync + 'static,
    ) -> Self {
        self.on_message = Some(Box::new(handler));
        self
    }

    /// Returns `true` if a message callback is set.
    #[inline]
    #[must_use]
    pub fn has_message_handler(&self) -> bool {
        self.on_message.is_some()
    }
}

impl fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks")
            .field("on_open", &self.on_open.is_some())
            .field("on_close", &self.on_close.is_some())
            .field("on_message", &self.on_message.is_some())
            .finish()
    }
}

// ============================================================================
// Connection
// ============================================================================

/// Handle to one connection opened through a [`ConnectionPool`].
///
/// # Thread Safety
///
/// `Connection` is `Send + Sync`. The transport handle sits behind a mutex
/// that the poller releases before running callbacks.
pub struct Connection {
    inner: Arc<Inner>,
}

struct Inner {
    /// Identity, unique for the process lifetime.
    id: ConnectionId,
    /// Target the connection was opened with.
    target: String,
    /// Transport handle; `None` once released.
    handle: Mutex<Option<Box<dyn TransportHandle>>>,
    /// Callback set.
    callbacks: Callbacks,
    /// Whether the poller currently owns a slot for this connection.
    registered: AtomicBool,
    /// Send retry settings.
    options: Arc<PoolOptions>,
    /// Owning pool.
    pool: Weak<ConnectionPool>,
}

impl Clone for Connection {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Connection {
    /// Wraps a freshly opened transport handle.
    pub(crate) fn new(
        id: ConnectionId,
        target: impl Into<String>,
        handle: Box<dyn TransportHandle>,
        callbacks: Callbacks,
        options: Arc<PoolOptions>,
        pool: Weak<ConnectionPool>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                id,
                target: target.into(),
                handle: Mutex::new(Some(handle)),
                callbacks,
                registered: AtomicBool::new(false),
                options,
                pool,
            }),
        }
    }

    /// Returns the connection identity.
    #[inline]
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    /// Returns the target the connection was opened with.
    #[inline]
    #[must_use]
    pub fn target(&self) -> &str {
        &self.inner.target
    }

    /// Returns `true` until the transport handle is released.
    #[inline]
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.inner.handle.lock().is_some()
    }

    /// Returns `true` while the connection is registered with the poller.
    #[inline]
    #[must_use]
    pub fn is_registered(&self) -> bool {
        self.inner.registered.load(Ordering::Acquire)
    }

    /// Sends a complete buffer.
    ///
    /// Loops until the transport has accepted every byte. When the
    /// transport cannot make progress the call backs off and retries, up to
    /// the pool's retry limit. A prefix that was already accepted stays sent
    /// if the call fails.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] if `data` is empty or the transport
    ///   rejects its contents
    /// - [`Error::ConnectionClosed`] if the connection is closed
    /// - [`Error::SendStalled`] if the retry limit is exhausted
    /// - [`Error::Transport`] for any other transport failure, returned
    ///   immediately
    pub fn send(&self, data: &[u8], kind: MessageKind) -> Result<()> {
        if data.is_empty() {
            return Err(Error::invalid_argument("send buffer must not be empty"));
        }

        let mut sent = 0;
        let mut stalled = 0u32;

        while sent < data.len() {
            let result = {
                let mut guard = self.inner.handle.lock();
                let handle = guard.as_mut().ok_or(Error::ConnectionClosed)?;
                handle.send(&data[sent..], kind)
            };

            match result {
                Ok(accepted) if accepted > 0 => {
                    sent = (sent + accepted).min(data.len());
                    stalled = 0;
                }
                Ok(_) => self.back_off(&mut stalled)?,
                Err(e) if e.is_would_block() => self.back_off(&mut stalled)?,
                Err(e @ (Error::ConnectionClosed | Error::InvalidArgument { .. })) => return Err(e),
                Err(e) => {
                    debug!(connection_id = %self.id(), sent, error = %e, "Send failed");
                    return Err(Error::transport(self.id(), e.to_string()));
                }
            }
        }

        trace!(connection_id = %self.id(), len = data.len(), "Message sent");
        Ok(())
    }

    /// Closes the connection.
    ///
    /// Releases the transport handle, runs `on_close` and removes the
    /// connection from its pool. Closing an already closed connection does
    /// nothing.
    pub fn close(&self) {
        if !self.release() {
            return;
        }

        if let Some(pool) = self.inner.pool.upgrade() {
            pool.remove_member(self);
        }
    }

    /// Sleeps before the next no-progress send attempt.
    fn back_off(&self, stalled: &mut u32) -> Result<()> {
        *stalled += 1;
        if *stalled >= self.inner.options.send_retry_limit {
            debug!(connection_id = %self.id(), attempts = *stalled, "Send stalled");
            return Err(Error::send_stalled(*stalled));
        }
        thread::sleep(self.inner.options.send_delay(*stalled));
        Ok(())
    }
}

// ============================================================================
// Connection - Internal
// ============================================================================

impl Connection {
    /// Returns `true` if this connection was opened by `pool`.
    pub(crate) fn belongs_to(&self, pool: &ConnectionPool) -> bool {
        std::ptr::eq(self.inner.pool.as_ptr(), pool)
    }

    /// Returns the pollable descriptor of the open handle.
    pub(crate) fn descriptor(&self) -> Result<Descriptor> {
        let guard = self.inner.handle.lock();
        let handle = guard.as_ref().ok_or(Error::ConnectionClosed)?;
        handle
            .descriptor()
            .ok_or_else(|| Error::no_descriptor(self.id()))
    }

    /// Runs `f` against the open handle, or returns `None` once released.
    pub(crate) fn with_handle<R>(&self, f: impl FnOnce(&mut dyn TransportHandle) -> R) -> Option<R> {
        let mut guard = self.inner.handle.lock();
        guard.as_mut().map(|handle| f(handle.as_mut()))
    }

    /// Returns `(has_buffered, wants_write)` for the open handle.
    pub(crate) fn poll_flags(&self) -> (bool, bool) {
        self.with_handle(|handle| (handle.has_buffered(), handle.wants_write()))
            .unwrap_or((false, false))
    }

    /// Releases the transport handle and runs `on_close`.
    ///
    /// Returns `false` if the handle was already released.
    pub(crate) fn release(&self) -> bool {
        let Some(handle) = self.inner.handle.lock().take() else {
            return false;
        };

        handle.close();
        debug!(connection_id = %self.id(), "Transport handle released");

        if let Some(ref handler) = self.inner.callbacks.on_close {
            handler(self);
        }
        true
    }

    pub(crate) fn set_registered(&self, registered: bool) {
        self.inner.registered.store(registered, Ordering::Release);
    }

    /// Clears the registered flag, returning its previous value.
    pub(crate) fn take_registered(&self) -> bool {
        self.inner.registered.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn fire_open(&self) {
        if let Some(ref handler) = self.inner.callbacks.on_open {
            handler(self);
        }
    }

    pub(crate) fn fire_message(&self, data: &[u8]) {
        if let Some(ref handler) = self.inner.callbacks.on_message {
            handler(self, data);
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("target", &self.inner.target)
            .field("open", &self.is_open())
            .field("registered", &self.is_registered())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use crate::transport::scripted::{ScriptedTransport, SendStep};
    use crate::transport::Transport;

    fn detached(transport: &ScriptedTransport, callbacks: Callbacks) -> Connection {
        let options = PoolOptions::new().with_send_retry(4, Duration::from_micros(10));
        let handle = transport.open("scripted://a").expect("open");
        Connection::new(
            ConnectionId::next(),
            "scripted://a",
            handle,
            callbacks,
            Arc::new(options),
            Weak::new(),
        )
    }

    #[test]
    fn test_callbacks_debug() {
        let callbacks = Callbacks::new().on_message(|_, _| {});
        assert!(callbacks.has_message_handler());
        assert_eq!(
            format!("{callbacks:?}"),
            "Callbacks { on_open: false, on_close: false, on_message: true }"
        );
    }

    #[test]
    fn test_send_in_chunks() {
        let transport = ScriptedTransport::new();
        let connection = detached(&transport, Callbacks::new());
        let script = transport.last_script();
        script.lock().send_plan.extend([
            SendStep::Accept(3),
            SendStep::Accept(4),
            SendStep::Accept(3),
        ]);

        connection
            .send(b"0123456789", MessageKind::Binary)
            .expect("send");

        let script = script.lock();
        assert_eq!(script.send_calls, 3);
        assert_eq!(script.sent, b"0123456789");
    }

    #[test]
    fn test_send_retries_would_block() {
        let transport = ScriptedTransport::new();
        let connection = detached(&transport, Callbacks::new());
        let script = transport.last_script();
        script.lock().send_plan.extend([
            SendStep::WouldBlock,
            SendStep::Accept(2),
            SendStep::WouldBlock,
            SendStep::Accept(2),
        ]);

        connection.send(b"abcd", MessageKind::Text).expect("send");

        let script = script.lock();
        assert_eq!(script.send_calls, 4);
        assert_eq!(script.sent, b"abcd");
    }

    #[test]
    fn test_send_stalls_after_limit() {
        let transport = ScriptedTransport::new();
        let connection = detached(&transport, Callbacks::new());
        let script = transport.last_script();
        script
            .lock()
            .send_plan
            .extend(std::iter::repeat_n(SendStep::WouldBlock, 10));

        let err = connection.send(b"abcd", MessageKind::Binary).unwrap_err();
        assert!(matches!(err, Error::SendStalled { attempts: 4 }));
    }

    #[test]
    fn test_send_error_keeps_prefix() {
        let transport = ScriptedTransport::new();
        let connection = detached(&transport, Callbacks::new());
        let script = transport.last_script();
        script
            .lock()
            .send_plan
            .extend([SendStep::Accept(2), SendStep::Fail]);

        let err = connection.send(b"abcd", MessageKind::Binary).unwrap_err();
        match err {
            Error::Transport { connection_id, .. } => assert_eq!(connection_id, connection.id()),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(script.lock().sent, b"ab");
    }

    #[test]
    fn test_send_rejects_empty() {
        let transport = ScriptedTransport::new();
        let connection = detached(&transport, Callbacks::new());
        let err = connection.send(b"", MessageKind::Binary).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { .. }));
    }

    #[test]
    fn test_close_is_idempotent() {
        let closes = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&closes);
        let transport = ScriptedTransport::new();
        let connection = detached(
            &transport,
            Callbacks::new().on_close(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        connection.close();
        connection.close();
        connection.clone().close();

        assert!(!connection.is_open());
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert_eq!(transport.last_script().lock().closes, 1);

        let err = connection.send(b"x", MessageKind::Binary).unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed));
    }

    #[test]
    fn test_descriptor_requires_open_handle() {
        let transport = ScriptedTransport::new();
        let connection = detached(&transport, Callbacks::new());
        assert!(connection.descriptor().is_ok());
        connection.close();
        assert!(matches!(
            connection.descriptor(),
            Err(Error::ConnectionClosed)
        ));
    }
}
