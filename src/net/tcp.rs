//! Default [`Socket`] implementation over the platform socket API.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};
use std::os::fd::OwnedFd;
use std::time::Duration;
use std::{fmt, io};

use libc::{AF_INET, AF_INET6};
use tracing::trace;

use super::socket::{ConnectProgress, IpVersion, ReceiveOutcome, Socket};
use super::sys;
use crate::config::{DEFAULT_RECEIVE_BUFFER_SIZE, DEFAULT_SLEEP_TIME};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Role {
    Idle,
    Listener { port: u16 },
    Connecting { ip: String, port: u16 },
    Connected,
}

/// Non-blocking TCP socket backed by a file descriptor.
///
/// The descriptor is closed when the socket is closed or dropped.
pub struct TcpSocket {
    fd: Option<OwnedFd>,
    role: Role,
    receive_buffer_size: usize,
    sleep_time: Duration,
    last_errno: i32,
}

impl TcpSocket {
    /// Creates a closed socket.
    pub fn new() -> Self {
        Self {
            fd: None,
            role: Role::Idle,
            receive_buffer_size: DEFAULT_RECEIVE_BUFFER_SIZE,
            sleep_time: DEFAULT_SLEEP_TIME,
            last_errno: 0,
        }
    }

    /// Creates a boxed closed socket. Usable as a
    /// [`SocketFactory`](super::SocketFactory).
    pub fn boxed() -> Box<dyn Socket> {
        Box::new(Self::new())
    }

    /// Address of the remote end, if connected.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.connected_fd().and_then(|fd| sys::peer_addr(fd).ok())
    }

    /// Local address the socket is bound to, if open.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.fd.as_ref().and_then(|fd| sys::local_addr(fd).ok())
    }

    fn connected_fd(&self) -> Option<&OwnedFd> {
        match self.role {
            Role::Connected => self.fd.as_ref(),
            _ => None,
        }
    }

    fn record(&mut self, err: &io::Error) {
        self.last_errno = err.raw_os_error().unwrap_or(0);
    }

    fn fail<T>(&mut self, err: io::Error) -> io::Result<T> {
        self.record(&err);
        Err(err)
    }

    fn open_listener(addr: SocketAddr, version: IpVersion) -> io::Result<OwnedFd> {
        let domain = if addr.is_ipv6() { AF_INET6 } else { AF_INET };
        let fd = sys::socket(domain)?;

        sys::set_reuseaddr(&fd)?;
        if addr.is_ipv6() {
            sys::set_v6only(&fd, version == IpVersion::V6)?;
        }
        sys::bind(&fd, &addr)?;
        sys::listen(&fd)?;

        Ok(fd)
    }

    /// Checks whether an in-flight connect has completed.
    fn finish_connect(&mut self) -> io::Result<ConnectProgress> {
        let Some(fd) = self.fd.as_ref() else {
            return self.fail(io::Error::from(io::ErrorKind::NotConnected));
        };

        let ready = match sys::poll_writable(fd, Duration::ZERO) {
            Ok(ready) => ready,
            Err(err) => {
                self.close();
                return self.fail(err);
            }
        };
        if !ready {
            return Ok(ConnectProgress::InProgress);
        }

        match sys::take_error(fd) {
            Ok(None) => {
                self.role = Role::Connected;
                self.last_errno = 0;
                Ok(ConnectProgress::Connected)
            }
            Ok(Some(err)) | Err(err) => {
                self.close();
                self.fail(err)
            }
        }
    }
}

/// Writes as much of `data` as the kernel accepts right now. Never waits: a
/// full send buffer ends the flush with whatever was written so far, and is
/// only an error when nothing was.
fn flush(fd: &OwnedFd, data: &[u8]) -> (usize, Option<io::Error>) {
    let mut written = 0;

    while written < data.len() {
        match sys::send(fd, &data[written..]) {
            Ok(0) => break,
            Ok(nbytes) => written += nbytes,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) if err.kind() == io::ErrorKind::WouldBlock && written > 0 => {
                trace!("send buffer full after {written} of {} bytes", data.len());
                break;
            }
            Err(err) => return (written, Some(err)),
        }
    }

    (written, None)
}

impl Default for TcpSocket {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TcpSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpSocket")
            .field("fd", &self.fd)
            .field("role", &self.role)
            .field("receive_buffer_size", &self.receive_buffer_size)
            .field("last_errno", &self.last_errno)
            .finish()
    }
}

impl Socket for TcpSocket {
    fn listen(&mut self, port: u16, version: IpVersion) -> io::Result<()> {
        self.close();

        if port == 0 {
            return self.fail(io::Error::from_raw_os_error(libc::EINVAL));
        }

        let unspecified_v4 = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
        let unspecified_v6 = SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port);
        let candidates = match version {
            IpVersion::Any => vec![unspecified_v6, unspecified_v4],
            IpVersion::V4 => vec![unspecified_v4],
            IpVersion::V6 => vec![unspecified_v6],
        };

        let mut last_err = io::Error::from(io::ErrorKind::AddrNotAvailable);
        for addr in candidates {
            match Self::open_listener(addr, version) {
                Ok(fd) => {
                    trace!("listening on {addr}");
                    self.fd = Some(fd);
                    self.role = Role::Listener { port };
                    self.last_errno = 0;
                    return Ok(());
                }
                Err(err) => {
                    trace!("cannot listen on {addr}: {err}");
                    last_err = err;
                }
            }
        }

        self.fail(last_err)
    }

    fn connect(&mut self, ip: &str, port: u16) -> io::Result<ConnectProgress> {
        if let Role::Connecting {
            ip: ref pending_ip,
            port: pending_port,
        } = self.role
        {
            if pending_ip == ip && pending_port == port {
                return self.finish_connect();
            }
        }

        self.close();

        let addr = match (ip, port).to_socket_addrs() {
            Ok(mut addrs) => match addrs.next() {
                Some(addr) => addr,
                None => {
                    return self.fail(io::Error::new(
                        io::ErrorKind::AddrNotAvailable,
                        format!("no address found for {ip}"),
                    ));
                }
            },
            Err(err) => return self.fail(err),
        };

        let domain = if addr.is_ipv6() { AF_INET6 } else { AF_INET };
        let fd = match sys::socket(domain) {
            Ok(fd) => fd,
            Err(err) => return self.fail(err),
        };

        match sys::connect(&fd, &addr) {
            Ok(()) => {
                self.fd = Some(fd);
                self.role = Role::Connected;
                self.last_errno = 0;
                Ok(ConnectProgress::Connected)
            }
            Err(err) if err.raw_os_error() == Some(libc::EINPROGRESS) => {
                self.fd = Some(fd);
                self.role = Role::Connecting {
                    ip: ip.to_string(),
                    port,
                };
                self.last_errno = 0;
                self.finish_connect()
            }
            Err(err) => self.fail(err),
        }
    }

    fn close(&mut self) {
        self.fd = None;
        self.role = Role::Idle;
    }

    fn accept(&mut self) -> io::Result<Option<Box<dyn Socket>>> {
        if !self.is_listener() {
            return self.fail(io::Error::from_raw_os_error(libc::EINVAL));
        }
        let Some(fd) = self.fd.as_ref() else {
            return self.fail(io::Error::from_raw_os_error(libc::EBADF));
        };

        match sys::accept(fd) {
            Ok((client, addr)) => {
                trace!("accepted connection from {addr}");
                self.last_errno = 0;

                Ok(Some(Box::new(TcpSocket {
                    fd: Some(client),
                    role: Role::Connected,
                    receive_buffer_size: self.receive_buffer_size,
                    sleep_time: self.sleep_time,
                    last_errno: 0,
                })))
            }
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::WouldBlock
                        | io::ErrorKind::Interrupted
                        | io::ErrorKind::ConnectionAborted
                ) =>
            {
                self.last_errno = 0;
                Ok(None)
            }
            Err(err) => self.fail(err),
        }
    }

    fn receive(&mut self) -> ReceiveOutcome {
        if self.is_listener() {
            return ReceiveOutcome::IsListener;
        }
        let Some(fd) = self.connected_fd() else {
            return ReceiveOutcome::NotConnected;
        };

        let mut buf = vec![0u8; self.receive_buffer_size.max(1)];
        match sys::recv(fd, &mut buf) {
            Ok(0) => {
                self.last_errno = 0;
                ReceiveOutcome::PeerDisconnected
            }
            Ok(nbytes) => {
                self.last_errno = 0;
                buf.truncate(nbytes);
                ReceiveOutcome::Data(buf)
            }
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                self.last_errno = 0;
                ReceiveOutcome::NothingAvailable
            }
            Err(err) => {
                self.record(&err);
                self.close();
                ReceiveOutcome::SystemError(err)
            }
        }
    }

    fn send(&mut self, data: &[u8]) -> io::Result<usize> {
        let Some(fd) = self.connected_fd() else {
            return self.fail(io::Error::from_raw_os_error(libc::ENOTCONN));
        };

        match flush(fd, data) {
            (0, Some(err)) => self.fail(err),
            (written, Some(err)) => {
                self.record(&err);
                Ok(written)
            }
            (written, None) => {
                self.last_errno = 0;
                Ok(written)
            }
        }
    }

    fn is_listener(&self) -> bool {
        matches!(self.role, Role::Listener { .. })
    }

    fn is_listening(&self) -> bool {
        self.fd.is_some() && self.is_listener()
    }

    fn is_connected(&self) -> bool {
        self.fd.is_some() && self.role == Role::Connected
    }

    fn listen_port(&self) -> u16 {
        match self.role {
            Role::Listener { port } => port,
            _ => 0,
        }
    }

    fn peer_ip_address(&self) -> String {
        self.peer_addr()
            .map(|addr| addr.ip().to_canonical().to_string())
            .unwrap_or_default()
    }

    fn peer_port(&self) -> u16 {
        self.peer_addr().map(|addr| addr.port()).unwrap_or(0)
    }

    fn peer_name(&self) -> String {
        self.peer_addr()
            .and_then(|addr| sys::name_info(&addr).ok())
            .unwrap_or_default()
    }

    fn own_ip_address(&self) -> String {
        match self.local_addr() {
            Some(addr) if !addr.ip().is_unspecified() => addr.ip().to_canonical().to_string(),
            _ => sys::host_name().unwrap_or_default(),
        }
    }

    fn last_errno(&self) -> i32 {
        self.last_errno
    }

    fn set_receive_buffer_size(&mut self, size: usize) {
        self.receive_buffer_size = size;
    }

    fn receive_buffer_size(&self) -> usize {
        self.receive_buffer_size
    }

    fn set_sleep_time(&mut self, sleep: Duration) {
        self.sleep_time = sleep;
    }

    fn sleep_time(&self) -> Duration {
        self.sleep_time
    }
}
