//! Background poller.
//!
//! One poller thread services every registered connection of a pool. The
//! thread owns its [`Registry`] outright; other threads submit membership
//! changes as [`Command`]s over an unbounded channel, which the poller
//! applies at the start of each cycle.
//!
//! # Cycle
//!
//! 1. Apply queued commands
//! 2. Stop if the registry is empty (re-checked under the lifecycle lock)
//! 3. Wait on all descriptors, bounded by the poll timeout; handles with
//!    pending output also wait for writability
//! 4. Fatal wait failure: evict everything and stop
//! 5. Reassemble and dispatch each ready connection; evict on error

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, error, info, trace, warn};

use crate::error::Error;
use crate::identifiers::ConnectionId;
use crate::transport::Descriptor;

use super::connection::Connection;
use super::core::ConnectionPool;
use super::readiness::Interest;
use super::reassembly::Reassembler;
use super::registry::{Registry, SlotKey};

// ============================================================================
// Command
// ============================================================================

/// Membership change submitted to the poller.
pub(crate) enum Command {
    /// Start polling a connection.
    Add {
        connection: Connection,
        descriptor: Descriptor,
    },
    /// Stop polling a connection that was closed elsewhere.
    Remove(ConnectionId),
}

// ============================================================================
// Poller
// ============================================================================

/// State of one poller thread.
pub(crate) struct Poller {
    pool: Arc<ConnectionPool>,
    commands: UnboundedReceiver<Command>,
    registry: Registry,
    reassembler: Reassembler,
    poll_timeout: Duration,
    // Per-cycle scratch, index-paired
    keys: Vec<SlotKey>,
    interests: Vec<Interest>,
    buffered: Vec<bool>,
    ready: Vec<bool>,
}

impl Poller {
    pub(crate) fn new(pool: Arc<ConnectionPool>, commands: UnboundedReceiver<Command>) -> Self {
        let reassembler = Reassembler::from_options(pool.options());
        let poll_timeout = pool.options().poll_timeout;

        Self {
            pool,
            commands,
            registry: Registry::new(),
            reassembler,
            poll_timeout,
            keys: Vec::new(),
            interests: Vec::new(),
            buffered: Vec::new(),
            ready: Vec::new(),
        }
    }

    /// Runs cycles until the registry empties or polling fails.
    pub(crate) fn run(mut self) {
        info!("Poller started");

        loop {
            self.apply_commands();

            if self.registry.is_empty() {
                if self.try_stop() {
                    break;
                }
                continue;
            }

            self.registry
                .snapshot(&mut self.keys, &mut self.interests, &mut self.buffered);
            self.ready.clear();
            self.ready.resize(self.keys.len(), false);

            // Data already in memory will not wake the descriptor
            let timeout = if self.buffered.contains(&true) {
                Duration::ZERO
            } else {
                self.poll_timeout
            };

            if let Err(e) = self
                .pool
                .readiness()
                .wait(&self.interests, timeout, &mut self.ready)
            {
                let err = Error::poll(e.to_string());
                error!(error = %err, connections = self.registry.len(), "Poll failed");
                self.shutdown();
                break;
            }

            for index in 0..self.keys.len() {
                if self.ready[index] || self.buffered[index] {
                    self.service(self.keys[index]);
                }
            }
        }

        info!("Poller stopped");
    }

    /// Applies every queued command without blocking.
    fn apply_commands(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            self.apply(command);
        }
    }

    fn apply(&mut self, command: Command) {
        match command {
            Command::Add {
                connection,
                descriptor,
            } => {
                trace!(connection_id = %connection.id(), descriptor, "Slot added");
                self.registry.insert(connection, descriptor);
            }
            Command::Remove(id) => {
                if self.registry.remove_by_id(id).is_some() {
                    trace!(connection_id = %id, "Slot removed");
                }
            }
        }
    }

    /// Stops if no work arrived since the registry emptied.
    ///
    /// Runs under the lifecycle lock, so a concurrent listen either lands
    /// in this final drain or sees the poller stopped and spawns a new one.
    fn try_stop(&mut self) -> bool {
        let pool = Arc::clone(&self.pool);
        let mut lifecycle = pool.lifecycle().lock();

        self.apply_commands();
        if !self.registry.is_empty() {
            return false;
        }

        lifecycle.commands = None;
        debug!("Registry empty, poller stopping");
        true
    }

    /// Evicts every connection after a fatal poll failure.
    fn shutdown(&mut self) {
        let mut doomed = self.registry.drain();

        {
            let mut lifecycle = self.pool.lifecycle().lock();
            while let Ok(command) = self.commands.try_recv() {
                if let Command::Add { connection, .. } = command {
                    doomed.push(connection);
                }
            }
            lifecycle.commands = None;
        }

        warn!(count = doomed.len(), "Evicting all connections");
        for connection in &doomed {
            self.pool.evict(connection);
        }
    }

    /// Reassembles and dispatches one ready connection.
    fn service(&mut self, key: SlotKey) {
        let reassembler = self.reassembler;
        let Some(slot) = self.registry.get_mut(key) else {
            return;
        };
        let connection = slot.connection.clone();
        let partial = &mut slot.partial;

        let outcome = connection.with_handle(|handle| reassembler.pump(handle, partial));

        match outcome {
            // Closed by another thread; its Remove command is on the way
            None => {
                self.registry.remove(key);
            }
            Some(Ok(Some(message))) => {
                trace!(connection_id = %connection.id(), len = message.len(), "Dispatching message");
                connection.fire_message(&message);
            }
            Some(Ok(None)) => {}
            Some(Err(Error::Allocation { requested })) => {
                warn!(connection_id = %connection.id(), requested, "Message dropped, buffer growth failed");
            }
            Some(Err(e)) => {
                let err = Error::transport(connection.id(), e.to_string());
                warn!(error = %err, "Evicting connection");
                self.registry.remove(key);
                self.pool.evict(&connection);
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
