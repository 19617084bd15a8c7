//! The minimal non-blocking transport contract the engine depends on.

use std::sync::Arc;
use std::time::Duration;
use std::{fmt, io};

/// IP version preference used when creating a listener.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum IpVersion {
    /// Let the socket implementation choose; dual-stack where available.
    #[default]
    Any,
    /// IPv4 only.
    V4,
    /// IPv6 only.
    V6,
}

/// Progress reported by [`Socket::connect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectProgress {
    /// The connection is established.
    Connected,
    /// The connection is still being established; call `connect` again with
    /// the same target to keep waiting.
    InProgress,
}

/// Result of a single non-blocking [`Socket::receive`].
#[derive(Debug)]
pub enum ReceiveOutcome {
    /// Bytes read from the connection.
    Data(Vec<u8>),
    /// Nothing to read right now. Not an error.
    NothingAvailable,
    /// The remote end shut the connection down in an orderly fashion.
    PeerDisconnected,
    /// The socket is not connected.
    NotConnected,
    /// The socket is a listener and cannot receive data.
    IsListener,
    /// The read failed at the OS level.
    SystemError(io::Error),
}

/// A creatable, closeable, pollable byte-stream endpoint or listener.
///
/// All operations must be non-blocking once a socket is set up; the engine
/// calls them while holding internal locks.
pub trait Socket: fmt::Debug + Send {
    /// Creates a listener on `port`. Port `0` must fail cleanly.
    fn listen(&mut self, port: u16, version: IpVersion) -> io::Result<()>;

    /// Starts or continues connecting to `ip:port`. Safe to call after
    /// [`Socket::close`].
    fn connect(&mut self, ip: &str, port: u16) -> io::Result<ConnectProgress>;

    /// Releases the underlying OS resources. Idempotent.
    fn close(&mut self);

    /// Accepts one pending connection. `Ok(None)` means nothing is pending.
    fn accept(&mut self) -> io::Result<Option<Box<dyn Socket>>>;

    /// Reads whatever is available, up to [`Socket::receive_buffer_size`]
    /// bytes.
    fn receive(&mut self) -> ReceiveOutcome;

    /// Writes as much of `data` as the transport accepts without blocking and
    /// returns the number of bytes written. Callers hold the engine's data
    /// lock, so implementations must never wait for the peer to drain.
    fn send(&mut self, data: &[u8]) -> io::Result<usize>;

    /// Whether this socket was set up with [`Socket::listen`].
    fn is_listener(&self) -> bool;

    /// Whether this socket is currently accepting connections.
    fn is_listening(&self) -> bool;

    /// Whether this socket is an established connection.
    fn is_connected(&self) -> bool;

    /// Port the listener is bound to, `0` if not listening.
    fn listen_port(&self) -> u16;

    /// IP address of the remote end, empty if unknown.
    fn peer_ip_address(&self) -> String;

    /// Port of the remote end, `0` if unknown.
    fn peer_port(&self) -> u16;

    /// Host name of the remote end, empty if unknown.
    fn peer_name(&self) -> String;

    /// Address of the local machine as seen by this socket.
    fn own_ip_address(&self) -> String;

    /// OS error code recorded by the last failed operation, `0` if none.
    fn last_errno(&self) -> i32;

    /// Human-readable form of [`Socket::last_errno`], empty if none.
    fn last_errno_string(&self) -> String {
        match self.last_errno() {
            0 => String::new(),
            code => io::Error::from_raw_os_error(code).to_string(),
        }
    }

    /// Sets the maximum number of bytes a single receive returns.
    fn set_receive_buffer_size(&mut self, size: usize);

    /// Maximum number of bytes a single receive returns.
    fn receive_buffer_size(&self) -> usize;

    /// Sets the interval the engine polls this socket at.
    fn set_sleep_time(&mut self, sleep: Duration);

    /// See [`Socket::set_sleep_time`].
    fn sleep_time(&self) -> Duration;
}

/// Creates fresh sockets for the engine (outbound connections and the
/// listener).
pub type SocketFactory = Arc<dyn Fn() -> Box<dyn Socket> + Send + Sync>;
