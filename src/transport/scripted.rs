//! Scripted transport for deterministic tests.
//!
//! Each opened handle gets a fake descriptor and a [`Script`] that lists
//! what its receive and send calls will return. [`ScriptedReadiness`]
//! reports a descriptor ready whenever its script has receive steps left.

// ============================================================================
// Imports
// ============================================================================

use std::collections::VecDeque;
use std::io::{Error as IoError, ErrorKind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::error::{Error, Result};
use crate::pool::{Interest, Readiness};

use super::{Descriptor, MessageKind, Received, Transport, TransportHandle};

// ============================================================================
// Script
// ============================================================================

/// One scripted receive outcome.
#[derive(Debug, Clone)]
pub(crate) enum RecvStep {
    /// Deliver bytes; `true` ends the logical message.
    Chunk(Vec<u8>, bool),
    /// Report that no data is available.
    WouldBlock,
    /// Fail with a connection reset.
    Fail,
}

/// One scripted send outcome.
#[derive(Debug, Clone)]
pub(crate) enum SendStep {
    /// Accept at most this many bytes.
    Accept(usize),
    /// Report that the transport is full.
    WouldBlock,
    /// Fail with a broken pipe.
    Fail,
}

/// Script and observations for one handle.
#[derive(Debug, Default)]
pub(crate) struct Script {
    pub recv: VecDeque<RecvStep>,
    pub send_plan: VecDeque<SendStep>,
    pub sent: Vec<u8>,
    pub send_calls: usize,
    pub recv_calls: usize,
    pub closes: usize,
    /// Reported by the handle's `wants_write`.
    pub wants_write: bool,
}

impl Script {
    pub(crate) fn chunk(&mut self, data: &[u8], complete: bool) -> &mut Self {
        self.recv.push_back(RecvStep::Chunk(data.to_vec(), complete));
        self
    }

    pub(crate) fn would_block(&mut self) -> &mut Self {
        self.recv.push_back(RecvStep::WouldBlock);
        self
    }

    pub(crate) fn fail(&mut self) -> &mut Self {
        self.recv.push_back(RecvStep::Fail);
        self
    }
}

// ============================================================================
// ScriptedTransport
// ============================================================================

/// Transport whose handles follow per-handle scripts.
#[derive(Default)]
pub(crate) struct ScriptedTransport {
    next_descriptor: AtomicUsize,
    scripts: Mutex<FxHashMap<Descriptor, Arc<Mutex<Script>>>>,
    last: Mutex<Option<Arc<Mutex<Script>>>>,
    refuse: AtomicBool,
    no_descriptor: AtomicBool,
}

impl ScriptedTransport {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            next_descriptor: AtomicUsize::new(1000),
            ..Self::default()
        })
    }

    /// Makes every later open fail.
    pub(crate) fn refuse_connections(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Makes later handles report no descriptor.
    pub(crate) fn without_descriptors(&self, missing: bool) {
        self.no_descriptor.store(missing, Ordering::SeqCst);
    }

    /// Script of the most recently opened handle.
    pub(crate) fn last_script(&self) -> Arc<Mutex<Script>> {
        self.last.lock().clone().expect("no handle opened yet")
    }

    fn script(&self, descriptor: Descriptor) -> Option<Arc<Mutex<Script>>> {
        self.scripts.lock().get(&descriptor).cloned()
    }
}

impl Transport for ScriptedTransport {
    fn open(&self, target: &str) -> Result<Box<dyn TransportHandle>> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(Error::connection(target, "refused by script"));
        }

        let descriptor = self.next_descriptor.fetch_add(1, Ordering::SeqCst) as Descriptor;
        let script = Arc::new(Mutex::new(Script::default()));
        self.scripts.lock().insert(descriptor, Arc::clone(&script));
        *self.last.lock() = Some(Arc::clone(&script));

        Ok(Box::new(ScriptedHandle {
            descriptor: (!self.no_descriptor.load(Ordering::SeqCst)).then_some(descriptor),
            script,
        }))
    }
}

struct ScriptedHandle {
    descriptor: Option<Descriptor>,
    script: Arc<Mutex<Script>>,
}

impl TransportHandle for ScriptedHandle {
    fn send(&mut self, data: &[u8], _kind: MessageKind) -> Result<usize> {
        let mut script = self.script.lock();
        script.send_calls += 1;
        match script.send_plan.pop_front() {
            Some(SendStep::Accept(limit)) => {
                let accepted = limit.min(data.len());
                script.sent.extend_from_slice(&data[..accepted]);
                Ok(accepted)
            }
            None => {
                script.sent.extend_from_slice(data);
                Ok(data.len())
            }
            Some(SendStep::WouldBlock) => Err(Error::WouldBlock),
            Some(SendStep::Fail) => Err(IoError::from(ErrorKind::BrokenPipe).into()),
        }
    }

    fn recv(&mut self, buf: &mut [u8]) -> Result<Received> {
        let mut script = self.script.lock();
        script.recv_calls += 1;
        match script.recv.pop_front() {
            Some(RecvStep::Chunk(mut data, complete)) => {
                let len = data.len().min(buf.len());
                buf[..len].copy_from_slice(&data[..len]);
                if len < data.len() {
                    let rest = data.split_off(len);
                    script.recv.push_front(RecvStep::Chunk(rest, complete));
                    return Ok(Received::partial(len));
                }
                Ok(Received { len, complete })
            }
            Some(RecvStep::WouldBlock) | None => Err(Error::WouldBlock),
            Some(RecvStep::Fail) => Err(IoError::from(ErrorKind::ConnectionReset).into()),
        }
    }

    fn descriptor(&self) -> Option<Descriptor> {
        self.descriptor
    }

    fn wants_write(&self) -> bool {
        self.script.lock().wants_write
    }

    fn close(self: Box<Self>) {
        self.script.lock().closes += 1;
    }
}

// ============================================================================
// ScriptedReadiness
// ============================================================================

/// Readiness backed by the scripts of a [`ScriptedTransport`].
pub(crate) struct ScriptedReadiness {
    transport: Arc<ScriptedTransport>,
    fail: AtomicBool,
    waits: AtomicUsize,
    last_wait: Mutex<Option<(Vec<Interest>, Duration)>>,
}

impl ScriptedReadiness {
    pub(crate) fn new(transport: Arc<ScriptedTransport>) -> Arc<Self> {
        Arc::new(Self {
            transport,
            fail: AtomicBool::new(false),
            waits: AtomicUsize::new(0),
            last_wait: Mutex::new(None),
        })
    }

    /// Makes the next wait fail fatally.
    pub(crate) fn fail_next_wait(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    pub(crate) fn waits(&self) -> usize {
        self.waits.load(Ordering::SeqCst)
    }

    /// Interests and timeout of the most recent wait.
    pub(crate) fn last_wait(&self) -> Option<(Vec<Interest>, Duration)> {
        self.last_wait.lock().clone()
    }
}

impl Readiness for ScriptedReadiness {
    fn wait(
        &self,
        interests: &[Interest],
        timeout: Duration,
        ready: &mut [bool],
    ) -> std::io::Result<usize> {
        *self.last_wait.lock() = Some((interests.to_vec(), timeout));
        self.waits.fetch_add(1, Ordering::SeqCst);

        if self.fail.swap(false, Ordering::SeqCst) {
            return Err(IoError::other("scripted poll failure"));
        }

        let mut count = 0;
        // Scripted sockets never become writable
        for (slot, interest) in ready.iter_mut().zip(interests) {
            *slot = self
                .transport
                .script(interest.descriptor)
                .is_some_and(|script| !script.lock().recv.is_empty());
            count += usize::from(*slot);
        }

        if count == 0 {
            thread::sleep(timeout.min(Duration::from_millis(2)));
        }
        Ok(count)
    }
}
