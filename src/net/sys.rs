//! Thin wrappers around the socket system calls used by
//! [`TcpSocket`](super::TcpSocket).
//!
//! Every descriptor created here is non-blocking and close-on-exec.

use std::ffi::CStr;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;
use std::{io, mem};

use libc::{
    AF_INET, AF_INET6, IPPROTO_IPV6, IPV6_V6ONLY, MSG_NOSIGNAL, POLLERR, POLLHUP, POLLOUT,
    SO_ERROR, SO_REUSEADDR, SOCK_CLOEXEC, SOCK_NONBLOCK, SOCK_STREAM, SOL_SOCKET, c_char, c_int,
    c_void, sockaddr, sockaddr_in, sockaddr_in6, sockaddr_storage, socklen_t,
};

use crate::error::errno;

/// Pending connections the kernel queues for a listener before refusing new
/// ones.
const LISTEN_BACKLOG: c_int = 20;

/// Buffer length for `getnameinfo(3)` host names (`NI_MAXHOST`).
const MAX_HOST_LEN: usize = 1025;

/// Creates a non-blocking stream socket for the given address family.
pub(crate) fn socket(domain: c_int) -> io::Result<OwnedFd> {
    let fd = unsafe { libc::socket(domain, SOCK_STREAM | SOCK_NONBLOCK | SOCK_CLOEXEC, 0) };
    if fd < 0 {
        return Err(errno!("failed to create socket"));
    }

    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Enables `SO_REUSEADDR` so a listener can be re-bound right after it was
/// closed.
pub(crate) fn set_reuseaddr(fd: &OwnedFd) -> io::Result<()> {
    set_int_option(fd, SOL_SOCKET, SO_REUSEADDR, 1)
        .map_err(|err| io::Error::new(err.kind(), format!("failed to set SO_REUSEADDR: {err}")))
}

/// Sets `IPV6_V6ONLY`. Disabling it makes an IPv6 listener dual-stack.
pub(crate) fn set_v6only(fd: &OwnedFd, v6only: bool) -> io::Result<()> {
    set_int_option(fd, IPPROTO_IPV6, IPV6_V6ONLY, v6only as c_int)
        .map_err(|err| io::Error::new(err.kind(), format!("failed to set IPV6_V6ONLY: {err}")))
}

fn set_int_option(fd: &OwnedFd, level: c_int, name: c_int, value: c_int) -> io::Result<()> {
    let rc = unsafe {
        libc::setsockopt(
            fd.as_raw_fd(),
            level,
            name,
            &value as *const c_int as *const c_void,
            mem::size_of::<c_int>() as socklen_t,
        )
    };

    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Binds a socket to `addr`.
pub(crate) fn bind(fd: &OwnedFd, addr: &SocketAddr) -> io::Result<()> {
    let (storage, len) = socketaddr_to_storage(addr);

    let rc = unsafe {
        libc::bind(
            fd.as_raw_fd(),
            &storage as *const sockaddr_storage as *const sockaddr,
            len,
        )
    };
    if rc < 0 {
        return Err(errno!("failed to bind to {addr}"));
    }

    Ok(())
}

/// Marks a bound socket as a listener.
pub(crate) fn listen(fd: &OwnedFd) -> io::Result<()> {
    if unsafe { libc::listen(fd.as_raw_fd(), LISTEN_BACKLOG) } < 0 {
        return Err(errno!("failed to listen"));
    }

    Ok(())
}

/// Accepts one pending connection. The new descriptor is non-blocking.
///
/// Returns an error of kind [`io::ErrorKind::WouldBlock`] when nothing is
/// pending.
pub(crate) fn accept(fd: &OwnedFd) -> io::Result<(OwnedFd, SocketAddr)> {
    let mut storage: sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<sockaddr_storage>() as socklen_t;

    let client = unsafe {
        libc::accept4(
            fd.as_raw_fd(),
            &mut storage as *mut sockaddr_storage as *mut sockaddr,
            &mut len,
            SOCK_NONBLOCK | SOCK_CLOEXEC,
        )
    };
    if client < 0 {
        return Err(io::Error::last_os_error());
    }

    let client = unsafe { OwnedFd::from_raw_fd(client) };
    let addr = storage_to_socketaddr(&storage)?;

    Ok((client, addr))
}

/// Starts a non-blocking connect.
///
/// An error with raw code `EINPROGRESS` means the connection is being
/// established; use [`poll_writable`] and [`take_error`] to finish it.
pub(crate) fn connect(fd: &OwnedFd, addr: &SocketAddr) -> io::Result<()> {
    let (storage, len) = socketaddr_to_storage(addr);

    let rc = unsafe {
        libc::connect(
            fd.as_raw_fd(),
            &storage as *const sockaddr_storage as *const sockaddr,
            len,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

/// Waits up to `timeout` for the socket to become writable (or to report an
/// error). A zero timeout only checks the current state.
pub(crate) fn poll_writable(fd: &OwnedFd, timeout: Duration) -> io::Result<bool> {
    let mut pfd = libc::pollfd {
        fd: fd.as_raw_fd(),
        events: POLLOUT,
        revents: 0,
    };
    let timeout_ms = timeout.as_millis().min(c_int::MAX as u128) as c_int;

    let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
    if rc < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(false);
        }
        return Err(err);
    }

    Ok(rc > 0 && pfd.revents & (POLLOUT | POLLERR | POLLHUP) != 0)
}

/// Reads and clears the pending socket error (`SO_ERROR`).
pub(crate) fn take_error(fd: &OwnedFd) -> io::Result<Option<io::Error>> {
    let mut value: c_int = 0;
    let mut len = mem::size_of::<c_int>() as socklen_t;

    let rc = unsafe {
        libc::getsockopt(
            fd.as_raw_fd(),
            SOL_SOCKET,
            SO_ERROR,
            &mut value as *mut c_int as *mut c_void,
            &mut len,
        )
    };
    if rc < 0 {
        return Err(errno!("failed to read SO_ERROR"));
    }

    Ok((value != 0).then(|| io::Error::from_raw_os_error(value)))
}

/// Receives into `buf`. `Ok(0)` means the peer performed an orderly shutdown.
pub(crate) fn recv(fd: &OwnedFd, buf: &mut [u8]) -> io::Result<usize> {
    let rc = unsafe {
        libc::recv(
            fd.as_raw_fd(),
            buf.as_mut_ptr() as *mut c_void,
            buf.len(),
            0,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(rc as usize)
}

/// Sends from `buf` without raising `SIGPIPE` on a closed connection.
pub(crate) fn send(fd: &OwnedFd, buf: &[u8]) -> io::Result<usize> {
    let rc = unsafe {
        libc::send(
            fd.as_raw_fd(),
            buf.as_ptr() as *const c_void,
            buf.len(),
            MSG_NOSIGNAL,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(rc as usize)
}

/// Returns the address of the remote end of a connected socket.
pub(crate) fn peer_addr(fd: &OwnedFd) -> io::Result<SocketAddr> {
    sockaddr_of(fd.as_raw_fd(), libc::getpeername)
}

/// Returns the local address of a socket.
pub(crate) fn local_addr(fd: &OwnedFd) -> io::Result<SocketAddr> {
    sockaddr_of(fd.as_raw_fd(), libc::getsockname)
}

fn sockaddr_of(
    fd: RawFd,
    query: unsafe extern "C" fn(c_int, *mut sockaddr, *mut socklen_t) -> c_int,
) -> io::Result<SocketAddr> {
    let mut storage: sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<sockaddr_storage>() as socklen_t;

    let rc = unsafe {
        query(
            fd,
            &mut storage as *mut sockaddr_storage as *mut sockaddr,
            &mut len,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }

    storage_to_socketaddr(&storage)
}

/// Resolves the host name of `addr` with `getnameinfo(3)`.
///
/// Falls back to the numeric form when no name is registered.
pub(crate) fn name_info(addr: &SocketAddr) -> io::Result<String> {
    let (storage, len) = socketaddr_to_storage(addr);
    let mut host = [0 as c_char; MAX_HOST_LEN];

    let rc = unsafe {
        libc::getnameinfo(
            &storage as *const sockaddr_storage as *const sockaddr,
            len,
            host.as_mut_ptr(),
            host.len() as _,
            std::ptr::null_mut(),
            0,
            0,
        )
    };
    if rc != 0 {
        let reason = unsafe { CStr::from_ptr(libc::gai_strerror(rc)) };
        return Err(io::Error::other(format!(
            "failed to resolve name of {addr}: {}",
            reason.to_string_lossy()
        )));
    }

    let name = unsafe { CStr::from_ptr(host.as_ptr()) };
    Ok(name.to_string_lossy().into_owned())
}

/// Returns the host name of this machine.
pub(crate) fn host_name() -> io::Result<String> {
    let mut buf = [0 as c_char; MAX_HOST_LEN];

    if unsafe { libc::gethostname(buf.as_mut_ptr(), buf.len()) } < 0 {
        return Err(errno!("failed to read host name"));
    }
    // Not guaranteed to be terminated on truncation.
    buf[MAX_HOST_LEN - 1] = 0;

    let name = unsafe { CStr::from_ptr(buf.as_ptr()) };
    Ok(name.to_string_lossy().into_owned())
}

/// Converts a `sockaddr_storage` to a Rust `SocketAddr`.
fn storage_to_socketaddr(storage: &sockaddr_storage) -> io::Result<SocketAddr> {
    match storage.ss_family as c_int {
        AF_INET => {
            let addr = unsafe { &*(storage as *const sockaddr_storage as *const sockaddr_in) };
            let ip = Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
            let port = u16::from_be(addr.sin_port);

            Ok(SocketAddr::V4(SocketAddrV4::new(ip, port)))
        }
        AF_INET6 => {
            let addr = unsafe { &*(storage as *const sockaddr_storage as *const sockaddr_in6) };
            let ip = Ipv6Addr::from(addr.sin6_addr.s6_addr);
            let port = u16::from_be(addr.sin6_port);

            Ok(SocketAddr::V6(SocketAddrV6::new(
                ip,
                port,
                addr.sin6_flowinfo,
                addr.sin6_scope_id,
            )))
        }
        family => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unsupported address family: {family}"),
        )),
    }
}

/// Converts a `SocketAddr` to a `sockaddr_storage` and its effective length.
fn socketaddr_to_storage(addr: &SocketAddr) -> (sockaddr_storage, socklen_t) {
    let mut storage: sockaddr_storage = unsafe { mem::zeroed() };

    match addr {
        SocketAddr::V4(v4) => {
            let sa = unsafe { &mut *(&mut storage as *mut sockaddr_storage as *mut sockaddr_in) };
            sa.sin_family = AF_INET as _;
            sa.sin_port = v4.port().to_be();
            sa.sin_addr.s_addr = u32::from(*v4.ip()).to_be();

            (storage, mem::size_of::<sockaddr_in>() as socklen_t)
        }
        SocketAddr::V6(v6) => {
            let sa = unsafe { &mut *(&mut storage as *mut sockaddr_storage as *mut sockaddr_in6) };
            sa.sin6_family = AF_INET6 as _;
            sa.sin6_port = v6.port().to_be();
            sa.sin6_addr.s6_addr = v6.ip().octets();
            sa.sin6_flowinfo = v6.flowinfo();
            sa.sin6_scope_id = v6.scope_id();

            (storage, mem::size_of::<sockaddr_in6>() as socklen_t)
        }
    }
}
