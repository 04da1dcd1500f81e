//! Connection pool.
//!
//! Multiplexes every registered connection on one lazily started poller
//! thread.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │                ConnectionPool                 │
//! │  members: ConnectionId → Connection           │
//! │                                               │
//! │  listen ──Add──►┐                             │
//! │  close ─Remove─►├─► channel ─► Poller thread  │
//! │                 ┘              (Registry)     │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! The poller thread starts on the first registration and exits once its
//! registry is empty. A later registration starts a fresh thread.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::mem;
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

use parking_lot::{Condvar, Mutex, RwLock};
use rustc_hash::FxHashMap;
use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::identifiers::ConnectionId;
use crate::transport::{MessageKind, Transport};

use super::builder::ConnectionPoolBuilder;
use super::connection::{Callbacks, Connection};
use super::options::PoolOptions;
use super::poller::{Command, Poller};
use super::readiness::Readiness;

// ============================================================================
// Lifecycle
// ============================================================================

/// Poller thread bookkeeping, guarded by the lifecycle lock.
///
/// Pollers are numbered by generation. A poller marks its generation
/// exited as the last thing its thread does, so every joiner can wait for
/// it without owning the join handle.
#[derive(Default)]
pub(crate) struct Lifecycle {
    /// Command channel of the running poller; `None` when stopped.
    pub(crate) commands: Option<UnboundedSender<Command>>,
    /// Join handle of the most recent poller, until someone reaps it.
    thread: Option<(u64, JoinHandle<()>)>,
    /// Thread of the most recent poller.
    poller: Option<ThreadId>,
    /// Generation of the most recently spawned poller.
    spawned: u64,
    /// Highest generation whose thread has finished.
    exited: u64,
    /// Generation of the last poller that panicked, or zero.
    panicked: u64,
}

/// Marks a poller generation exited when its thread finishes, panicking
/// or not.
struct ExitSignal {
    pool: Arc<ConnectionPool>,
    generation: u64,
}

impl Drop for ExitSignal {
    fn drop(&mut self) {
        let panicked = thread::panicking();
        let mut lifecycle = self.pool.lifecycle.lock();

        lifecycle.exited = lifecycle.exited.max(self.generation);
        if panicked {
            lifecycle.panicked = self.generation;
            if lifecycle.spawned == self.generation {
                lifecycle.commands = None;
            }
        }
        drop(lifecycle);

        self.pool.exited.notify_all();
    }
}

// ============================================================================
// ConnectionPool
// ============================================================================

/// Multiplexes many streaming connections on one background thread.
///
/// Thread-safe; every method may be called from any thread, including
/// from callbacks running on the poller thread.
///
/// # Example
///
/// ```ignore
/// use wsmux::{Callbacks, ConnectionPool, MessageKind};
///
/// let pool = ConnectionPool::new();
/// let connection = pool.start(
///     "ws://127.0.0.1:9001/feed",
///     Callbacks::new().on_message(|conn, data| {
///         println!("{}: {} bytes", conn.id(), data.len());
///     }),
/// )?;
///
/// connection.send(b"subscribe", MessageKind::Text)?;
/// // ...
/// connection.close();
/// pool.join_background_thread()?;
/// ```
pub struct ConnectionPool {
    /// Opens transport handles.
    transport: Arc<dyn Transport>,

    /// Multiplexing primitive used by the poller.
    readiness: Arc<dyn Readiness>,

    /// Pool configuration.
    options: Arc<PoolOptions>,

    /// Registered connections by identity.
    members: RwLock<FxHashMap<ConnectionId, Connection>>,

    /// Serializes registration against poller start and stop.
    lifecycle: Mutex<Lifecycle>,

    /// Signalled whenever a poller thread finishes.
    exited: Condvar,
}

// ============================================================================
// ConnectionPool - Constructor
// ============================================================================

impl ConnectionPool {
    /// Creates a pool with the WebSocket transport and default options.
    #[must_use]
    pub fn new() -> Arc<Self> {
        let options = PoolOptions::new();
        let transport = crate::transport::WebSocketTransport::new()
            .with_connect_timeout(options.connect_timeout);

        Self::from_parts(
            Arc::new(transport),
            Arc::new(super::readiness::PollReadiness::new()),
            options,
        )
    }

    /// Returns a builder for a customized pool.
    #[inline]
    #[must_use]
    pub fn builder() -> ConnectionPoolBuilder {
        ConnectionPoolBuilder::new()
    }

    pub(crate) fn from_parts(
        transport: Arc<dyn Transport>,
        readiness: Arc<dyn Readiness>,
        options: PoolOptions,
    ) -> Arc<Self> {
        debug!(?options, "ConnectionPool created");

        Arc::new(Self {
            transport,
            readiness,
            options: Arc::new(options),
            members: RwLock::new(FxHashMap::default()),
            lifecycle: Mutex::new(Lifecycle::default()),
            exited: Condvar::new(),
        })
    }
}

// ============================================================================
// ConnectionPool - Public API
// ============================================================================

impl ConnectionPool {
    /// Returns the pool configuration.
    #[inline]
    #[must_use]
    pub fn options(&self) -> &PoolOptions {
        &self.options
    }

    /// Returns the number of registered connections.
    #[inline]
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.members.read().len()
    }

    /// Returns `true` if `id` is registered.
    #[inline]
    #[must_use]
    pub fn contains(&self, id: ConnectionId) -> bool {
        self.members.read().contains_key(&id)
    }

    /// Returns the registered connection with identity `id`.
    #[must_use]
    pub fn get(&self, id: ConnectionId) -> Option<Connection> {
        self.members.read().get(&id).cloned()
    }

    /// Returns `true` while a poller thread is running.
    #[inline]
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.lifecycle.lock().commands.is_some()
    }

    /// Opens a connection to `target`.
    ///
    /// Blocks for the transport handshake. On success the connection gets
    /// the next identity and `on_open` runs on the calling thread. The
    /// connection is not polled until [`listen`](Self::listen).
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] if `target` is empty or no message
    ///   callback is set
    /// - the transport's error (usually [`Error::Connection`]) if opening
    ///   fails; no identity is consumed
    pub fn connect(self: &Arc<Self>, target: &str, callbacks: Callbacks) -> Result<Connection> {
        if target.is_empty() {
            return Err(Error::invalid_argument("target must not be empty"));
        }
        if !callbacks.has_message_handler() {
            return Err(Error::invalid_argument("a message callback is required"));
        }

        let handle = self.transport.open(target).inspect_err(|e| {
            warn!(target, error = %e, "Connect failed");
        })?;

        let id = ConnectionId::next();
        let connection = Connection::new(
            id,
            target,
            handle,
            callbacks,
            Arc::clone(&self.options),
            Arc::downgrade(self),
        );

        info!(connection_id = %id, target, "Connection opened");
        connection.fire_open();

        Ok(connection)
    }

    /// Registers a connection with the poller, starting it if needed.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] if the connection belongs to another pool
    /// - [`Error::AlreadyRegistered`] if it is already registered
    /// - [`Error::ConnectionClosed`] if it was closed
    /// - [`Error::NoDescriptor`] if its handle cannot be polled
    /// - [`Error::Allocation`] if membership cannot grow
    /// - [`Error::Io`] if the poller thread cannot be spawned
    ///
    /// On error, membership is left exactly as it was.
    pub fn listen(self: &Arc<Self>, connection: &Connection) -> Result<()> {
        let id = connection.id();

        if !connection.belongs_to(self) {
            return Err(Error::invalid_argument(
                "connection was opened by a different pool",
            ));
        }

        let mut lifecycle = self.lifecycle.lock();

        if connection.is_registered() {
            return Err(Error::already_registered(id));
        }
        let descriptor = connection.descriptor()?;

        {
            let mut members = self.members.write();
            members
                .try_reserve(1)
                .map_err(|_| Error::allocation(mem::size_of::<(ConnectionId, Connection)>()))?;
            members.insert(id, connection.clone());
        }
        connection.set_registered(true);

        let command = Command::Add {
            connection: connection.clone(),
            descriptor,
        };

        // A dead receiver means the last poller died without stopping cleanly
        let unsent = match lifecycle.commands.as_ref() {
            Some(commands) => commands.send(command).err().map(|e| e.0),
            None => Some(command),
        };

        if let Some(command) = unsent
            && let Err(e) = self.spawn_poller(&mut lifecycle, command)
        {
            connection.set_registered(false);
            self.members.write().remove(&id);
            return Err(e);
        }

        debug!(connection_id = %id, descriptor, "Connection registered");
        Ok(())
    }

    /// Connects and registers in one step.
    ///
    /// If registration fails the connection is closed again.
    ///
    /// # Errors
    ///
    /// Any error of [`connect`](Self::connect) or [`listen`](Self::listen).
    pub fn start(self: &Arc<Self>, target: &str, callbacks: Callbacks) -> Result<Connection> {
        let connection = self.connect(target, callbacks)?;

        if let Err(e) = self.listen(&connection) {
            connection.close();
            return Err(e);
        }

        Ok(connection)
    }

    /// Sends a complete buffer on `connection`.
    ///
    /// See [`Connection::send`].
    ///
    /// # Errors
    ///
    /// See [`Connection::send`].
    #[inline]
    pub fn send(&self, connection: &Connection, data: &[u8], kind: MessageKind) -> Result<()> {
        connection.send(data, kind)
    }

    /// Closes `connection`. Closing twice is a no-op.
    #[inline]
    pub fn close(&self, connection: &Connection) {
        connection.close();
    }

    /// Closes every registered connection.
    pub fn close_all(&self) {
        let connections: Vec<_> = self.members.read().values().cloned().collect();

        info!(count = connections.len(), "Closing all connections");
        for connection in connections {
            connection.close();
        }
    }

    /// Blocks until the current poller thread exits.
    ///
    /// Returns immediately if no poller is running. Any number of threads
    /// may wait at once; all of them return once the poller that was
    /// current at the time of the call has finished. The poller exits on
    /// its own once every connection is closed.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] if called from the poller thread
    /// - [`Error::Poll`] if the poller thread panicked
    pub fn join_background_thread(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock();
        let target = lifecycle.spawned;

        if lifecycle.exited >= target {
            return Self::join_outcome(&lifecycle, target);
        }
        if lifecycle.poller == Some(thread::current().id()) {
            return Err(Error::invalid_argument(
                "the poller thread cannot join itself",
            ));
        }

        while lifecycle.exited < target {
            self.exited.wait(&mut lifecycle);
        }

        // The thread has run its last line; reap it if nobody has yet
        let handle = match lifecycle.thread.take() {
            Some((generation, handle)) if generation <= target => Some(handle),
            other => {
                lifecycle.thread = other;
                None
            }
        };
        let outcome = Self::join_outcome(&lifecycle, target);
        drop(lifecycle);

        if let Some(handle) = handle {
            let _ = handle.join();
        }

        debug!(generation = target, "Poller thread joined");
        outcome
    }

    fn join_outcome(lifecycle: &Lifecycle, target: u64) -> Result<()> {
        if target != 0 && lifecycle.panicked == target {
            return Err(Error::poll("poller thread panicked"));
        }
        Ok(())
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("connection_count", &self.connection_count())
            .field("is_running", &self.is_running())
            .field("options", &self.options)
            .finish()
    }
}

// ============================================================================
// ConnectionPool - Internal
// ============================================================================

impl ConnectionPool {
    pub(crate) fn readiness(&self) -> &dyn Readiness {
        self.readiness.as_ref()
    }

    pub(crate) fn lifecycle(&self) -> &Mutex<Lifecycle> {
        &self.lifecycle
    }

    /// Removes a connection closed outside the poller.
    pub(crate) fn remove_member(&self, connection: &Connection) {
        let id = connection.id();
        let lifecycle = self.lifecycle.lock();

        self.members.write().remove(&id);

        if connection.take_registered()
            && let Some(ref commands) = lifecycle.commands
        {
            // A closed channel means the poller is gone along with its slot
            let _ = commands.send(Command::Remove(id));
        }

        debug!(connection_id = %id, "Connection removed from pool");
    }

    /// Closes a connection on behalf of the poller.
    ///
    /// The caller has already dropped the poller slot.
    pub(crate) fn evict(&self, connection: &Connection) {
        self.members.write().remove(&connection.id());
        connection.set_registered(false);
        connection.release();
        debug!(connection_id = %connection.id(), "Connection evicted");
    }

    /// Starts a fresh poller thread whose first command is `command`.
    fn spawn_poller(self: &Arc<Self>, lifecycle: &mut Lifecycle, command: Command) -> Result<()> {
        let (commands, receiver) = mpsc::unbounded_channel();
        // The receiver is alive, so this cannot fail
        let _ = commands.send(command);

        let generation = lifecycle.spawned + 1;
        let pool = Arc::clone(self);
        let handle = thread::Builder::new()
            .name(self.options.thread_name.clone())
            .spawn(move || {
                // Built on the new thread so a failed spawn never signals
                let _signal = ExitSignal {
                    pool: Arc::clone(&pool),
                    generation,
                };
                Poller::new(pool, receiver).run();
            })?;

        // The previous thread, if any, has already left its loop
        lifecycle.spawned = generation;
        lifecycle.poller = Some(handle.thread().id());
        lifecycle.thread = Some((generation, handle));
        lifecycle.commands = Some(commands);

        debug!(thread = %self.options.thread_name, generation, "Poller thread spawned");
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
