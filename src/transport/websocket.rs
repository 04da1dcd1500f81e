//! WebSocket client transport.
//!
//! Opens plain `ws://` connections with a blocking handshake, then switches
//! the socket to non-blocking mode so the poller can multiplex it.
//!
//! # Receive Model
//!
//! tungstenite reads whole messages and may pull more than one off the
//! socket at a time. Every message that is available is drained into an
//! in-memory inbox and served through the chunked [`TransportHandle::recv`]
//! contract; [`TransportHandle::has_buffered`] keeps the poller coming back
//! while the inbox is non-empty.
//!
//! A frame the socket could not take in full stays in tungstenite's write
//! buffer. [`TransportHandle::wants_write`] asks the poller to wake on
//! writability, and the next `recv` pushes the rest out.

// ============================================================================
// Imports
// ============================================================================

use std::collections::VecDeque;
use std::io::ErrorKind;
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::os::fd::AsRawFd;
use std::time::Duration;

use tokio_tungstenite::tungstenite::{self, Error as WsError, Message, WebSocket};
use tracing::{debug, trace};
use url::Url;

use crate::error::{Error, Result};

use super::{Descriptor, MessageKind, Received, Transport, TransportHandle};

// ============================================================================
// Constants
// ============================================================================

/// Default timeout for TCP connect and the opening handshake.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// WebSocketTransport
// ============================================================================

/// Transport opening `ws://` client connections.
///
/// # Example
///
/// ```ignore
/// use std::time::Duration;
/// use wsmux::transport::WebSocketTransport;
///
/// let transport = WebSocketTransport::new().with_connect_timeout(Duration::from_secs(5));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebSocketTransport {
    /// Bound on TCP connect and handshake.
    connect_timeout: Duration,
}

impl Default for WebSocketTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl WebSocketTransport {
    /// Creates a transport with the default connect timeout.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Sets the connect and handshake timeout.
    #[inline]
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Returns the connect and handshake timeout.
    #[inline]
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Resolves a `ws://` target to a socket address.
    fn resolve(target: &str) -> Result<SocketAddr> {
        let url = Url::parse(target)?;

        match url.scheme() {
            "ws" => {}
            "wss" => {
                return Err(Error::invalid_argument(
                    "wss:// targets need TLS, which this transport does not provide",
                ));
            }
            other => {
                return Err(Error::invalid_argument(format!(
                    "unsupported scheme: {other}"
                )));
            }
        }

        let host = url
            .host_str()
            .ok_or_else(|| Error::invalid_argument("target has no host"))?;
        let port = url.port_or_known_default().unwrap_or(80);

        (host, port)
            .to_socket_addrs()
            .map_err(|e| Error::connection(target, format!("resolve failed: {e}")))?
            .next()
            .ok_or_else(|| Error::connection(target, "host resolved to no addresses"))
    }
}

impl Transport for WebSocketTransport {
    fn open(&self, target: &str) -> Result<Box<dyn TransportHandle>> {
        let addr = Self::resolve(target)?;

        let stream = TcpStream::connect_timeout(&addr, self.connect_timeout)
            .map_err(|e| Error::connection(target, e.to_string()))?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(self.connect_timeout))?;
        stream.set_write_timeout(Some(self.connect_timeout))?;

        trace!(target, %addr, "TCP connected");

        let (socket, response) = tungstenite::client(target, stream)
            .map_err(|e| Error::connection(target, format!("handshake failed: {e}")))?;

        let stream = socket.get_ref();
        stream.set_read_timeout(None)?;
        stream.set_write_timeout(None)?;
        stream.set_nonblocking(true)?;

        debug!(target, status = %response.status(), "WebSocket handshake completed");

        Ok(Box::new(WebSocketHandle::new(socket)))
    }
}

// ============================================================================
// WebSocketHandle
// ============================================================================

/// One open non-blocking WebSocket.
struct WebSocketHandle {
    /// Underlying socket, non-blocking after the handshake.
    socket: WebSocket<TcpStream>,
    /// Complete messages read off the socket but not yet delivered.
    inbox: VecDeque<Vec<u8>>,
    /// Message currently being delivered in chunks.
    current: Vec<u8>,
    /// Bytes of `current` already delivered.
    offset: usize,
    /// A queued frame still sits in tungstenite's write buffer.
    unflushed: bool,
    /// Peer sent a close frame or the stream ended.
    peer_closed: bool,
}

impl WebSocketHandle {
    fn new(socket: WebSocket<TcpStream>) -> Self {
        Self {
            socket,
            inbox: VecDeque::new(),
            current: Vec::new(),
            offset: 0,
            unflushed: false,
            peer_closed: false,
        }
    }

    /// Flushes any frame left over from an earlier send.
    fn flush_pending(&mut self) -> Result<()> {
        match self.socket.flush() {
            Ok(()) => {
                self.unflushed = false;
                Ok(())
            }
            Err(e) if is_would_block(&e) => Err(Error::WouldBlock),
            Err(e) => Err(e.into()),
        }
    }

    /// Reads every available message into the inbox.
    fn fill_inbox(&mut self) -> Result<()> {
        loop {
            match self.socket.read() {
                Ok(message @ (Message::Text(_) | Message::Binary(_))) => {
                    let data = message.into_data();
                    trace!(len = data.len(), "WebSocket message buffered");
                    self.inbox.push_back(data.to_vec());
                }
                Ok(Message::Close(frame)) => {
                    debug!(?frame, "WebSocket closed by remote");
                    self.peer_closed = true;
                    return Ok(());
                }
                // Ping/pong replies are queued by tungstenite itself
                Ok(_) => {}
                Err(e) if is_would_block(&e) => return Ok(()),
                Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => {
                    self.peer_closed = true;
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl TransportHandle for WebSocketHandle {
    fn send(&mut self, data: &[u8], kind: MessageKind) -> Result<usize> {
        if self.unflushed {
            self.flush_pending()?;
        }

        let message = match kind {
            MessageKind::Text => {
                let text = std::str::from_utf8(data).map_err(|e| {
                    Error::invalid_argument(format!("text message is not UTF-8: {e}"))
                })?;
                Message::text(text.to_owned())
            }
            MessageKind::Binary => Message::binary(data.to_vec()),
        };

        match self.socket.write(message) {
            Ok(()) => {}
            Err(WsError::WriteBufferFull(_)) => return Err(Error::WouldBlock),
            // The frame is queued; it goes out on the next flush
            Err(e) if is_would_block(&e) => {}
            Err(e) => return Err(e.into()),
        }

        match self.socket.flush() {
            Ok(()) => self.unflushed = false,
            Err(e) if is_would_block(&e) => self.unflushed = true,
            Err(e) => return Err(e.into()),
        }

        Ok(data.len())
    }

    fn recv(&mut self, buf: &mut [u8]) -> Result<Received> {
        if self.unflushed {
            match self.flush_pending() {
                Ok(()) | Err(Error::WouldBlock) => {}
                Err(e) => return Err(e),
            }
        }

        if self.offset == self.current.len() {
            if self.inbox.is_empty() && !self.peer_closed {
                self.fill_inbox()?;
            }

            match self.inbox.pop_front() {
                Some(message) => {
                    self.current = message;
                    self.offset = 0;
                }
                None if self.peer_closed => return Err(Error::ConnectionClosed),
                None => return Err(Error::WouldBlock),
            }
        }

        let remaining = &self.current[self.offset..];
        let len = remaining.len().min(buf.len());
        buf[..len].copy_from_slice(&remaining[..len]);
        self.offset += len;

        if self.offset == self.current.len() {
            self.current.clear();
            self.offset = 0;
            Ok(Received::complete(len))
        } else {
            Ok(Received::partial(len))
        }
    }

    fn descriptor(&self) -> Option<Descriptor> {
        Some(self.socket.get_ref().as_raw_fd())
    }

    fn has_buffered(&self) -> bool {
        self.peer_closed || !self.inbox.is_empty() || self.offset < self.current.len()
    }

    fn wants_write(&self) -> bool {
        self.unflushed
    }

    fn close(mut self: Box<Self>) {
        match self.socket.close(None) {
            Ok(()) | Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => {}
            Err(e) if is_would_block(&e) => {}
            Err(e) => debug!(error = %e, "Close frame not sent"),
        }

        if let Err(e) = self.socket.flush()
            && !is_would_block(&e)
        {
            trace!(error = %e, "Close flush failed");
        }

        if let Err(e) = self.socket.get_ref().shutdown(Shutdown::Both) {
            trace!(error = %e, "TCP shutdown failed");
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Returns `true` if a tungstenite error is a non-blocking stall.
fn is_would_block(e: &WsError) -> bool {
    matches!(e, WsError::Io(io) if io.kind() == ErrorKind::WouldBlock)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Error as IoError;

    #[test]
    fn test_default_timeout() {
        assert_eq!(
            WebSocketTransport::new().connect_timeout(),
            DEFAULT_CONNECT_TIMEOUT
        );
        let transport = WebSocketTransport::new().with_connect_timeout(Duration::from_secs(2));
        assert_eq!(transport.connect_timeout(), Duration::from_secs(2));
    }

    #[test]
    fn test_resolve_rejects_wss() {
        let err = WebSocketTransport::resolve("wss://127.0.0.1:9001").unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { .. }));
    }

    #[test]
    fn test_resolve_rejects_unknown_scheme() {
        let err = WebSocketTransport::resolve("http://127.0.0.1").unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { .. }));
    }

    #[test]
    fn test_resolve_rejects_garbage() {
        let err = WebSocketTransport::resolve("not a url").unwrap_err();
        assert!(matches!(err, Error::Url(_)));
    }

    #[test]
    fn test_resolve_default_port() {
        let addr = WebSocketTransport::resolve("ws://127.0.0.1/feed").expect("resolve");
        assert_eq!(addr.port(), 80);
        let addr = WebSocketTransport::resolve("ws://127.0.0.1:9001").expect("resolve");
        assert_eq!(addr.port(), 9001);
    }

    #[test]
    fn test_open_refused() {
        // Bind then drop to get a port nothing listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();
        drop(listener);

        let transport = WebSocketTransport::new().with_connect_timeout(Duration::from_secs(2));
        let result = transport.open(&format!("ws://127.0.0.1:{port}"));
        assert!(matches!(result, Err(Error::Connection { .. })));
    }

    #[test]
    fn test_unflushed_frame_wants_write() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let (done, finished) = std::sync::mpsc::channel::<()>();

        // Completes the handshake, then never reads
        let server = std::thread::spawn(move || {
            let (stream, _) = listener.accept().expect("accept");
            let socket = tungstenite::accept(stream).expect("handshake");
            let _ = finished.recv();
            drop(socket);
        });

        let transport = WebSocketTransport::new().with_connect_timeout(Duration::from_secs(2));
        let mut handle = transport
            .open(&format!("ws://127.0.0.1:{port}"))
            .expect("open");
        assert!(!handle.wants_write());

        let payload = vec![0x5A; 32 * 1024 * 1024];
        let accepted = handle.send(&payload, MessageKind::Binary).expect("send");
        assert_eq!(accepted, payload.len());
        assert!(handle.wants_write());
        assert!(!handle.has_buffered());

        handle.close();
        let _ = done.send(());
        server.join().expect("server");
    }

    #[test]
    fn test_is_would_block() {
        assert!(is_would_block(&WsError::Io(IoError::from(
            ErrorKind::WouldBlock
        ))));
        assert!(!is_would_block(&WsError::ConnectionClosed));
    }
}
