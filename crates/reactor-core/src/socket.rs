//! Raw socket-option plumbing the standard library and `mio` don't expose
//! (`SO_REUSEADDR`/`SO_REUSEPORT` on bind, `SO_KEEPALIVE` on an accepted
//! connection). Grounded in `original_source/include/Socket.h`'s
//! `setReuseAddr`/`setReusePort`/`setKeepAlive`/`setTcpNoDelay` wrappers,
//! and in the teacher's own willingness to reach for a raw `libc::setsockopt`
//! call where the ecosystem doesn't cover it
//! (`flux-network/src/tcp/stream.rs`'s `set_socket_buf_size`).

use std::io;
use std::mem;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, FromRawFd};

use crate::address::Address;

fn setsockopt_bool(fd: i32, level: i32, name: i32, value: bool) -> io::Result<()> {
    let v: libc::c_int = i32::from(value);
    let rc = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            std::ptr::addr_of!(v).cast(),
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn sockaddr_in_from(addr: &Address) -> libc::sockaddr_in {
    let mut sa: libc::sockaddr_in = unsafe { mem::zeroed() };
    sa.sin_family = libc::AF_INET as libc::sa_family_t;
    sa.sin_port = addr.port().to_be();
    sa.sin_addr.s_addr = u32::from_ne_bytes(addr.ip().octets()).to_be();
    // `to_be` above is a no-op on big-endian hosts and the intended byte
    // swap on little-endian ones, matching `htonl`/`htons`.
    sa
}

/// Builds a non-blocking, close-on-exec, `SO_REUSEADDR` (and optionally
/// `SO_REUSEPORT`) listening socket bound to `addr` (§4.5). `socket`/`bind`/
/// `listen` failures are fatal initialization failures per §7 -- there is no
/// reasonable way for the acceptor to proceed without its listener.
pub(crate) fn create_listener(addr: &Address, reuse_port: bool) -> mio::net::TcpListener {
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
    if fd < 0 {
        reactor_utils::fatal!(error = %io::Error::last_os_error(), "socket() failed");
    }

    if let Err(e) = setsockopt_bool(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, true) {
        reactor_utils::fatal!(error = %e, "setsockopt(SO_REUSEADDR) failed");
    }
    if reuse_port {
        if let Err(e) = setsockopt_bool(fd, libc::SOL_SOCKET, libc::SO_REUSEPORT, true) {
            reactor_utils::fatal!(error = %e, "setsockopt(SO_REUSEPORT) failed");
        }
    }

    let sa = sockaddr_in_from(addr);
    let bind_rc = unsafe {
        libc::bind(
            fd,
            std::ptr::addr_of!(sa).cast(),
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if bind_rc != 0 {
        reactor_utils::fatal!(addr = %addr, error = %io::Error::last_os_error(), "bind() failed");
    }

    const BACKLOG: i32 = 1024;
    if unsafe { libc::listen(fd, BACKLOG) } != 0 {
        reactor_utils::fatal!(error = %io::Error::last_os_error(), "listen() failed");
    }

    let std_listener = unsafe { std::net::TcpListener::from_raw_fd(fd) };
    mio::net::TcpListener::from_std(std_listener)
}

/// `SO_KEEPALIVE`, on by default for every accepted connection (§6). Not
/// fatal on failure -- the connection is already usable without it.
pub(crate) fn set_keepalive(stream: &mio::net::TcpStream, on: bool) {
    if let Err(e) = setsockopt_bool(stream.as_raw_fd(), libc::SOL_SOCKET, libc::SO_KEEPALIVE, on) {
        tracing::warn!(error = %e, "setsockopt(SO_KEEPALIVE) failed");
    }
}

/// `TCP_NODELAY`, on by default for every accepted connection (§4.6's
/// socket-options supplement).
pub(crate) fn set_nodelay(stream: &mio::net::TcpStream, on: bool) {
    if let Err(e) = stream.set_nodelay(on) {
        tracing::warn!(error = %e, "setsockopt(TCP_NODELAY) failed");
    }
}

pub(crate) fn local_addr(stream: &mio::net::TcpStream) -> Address {
    match stream.local_addr() {
        Ok(SocketAddr::V4(v4)) => Address::new(*v4.ip(), v4.port()),
        Ok(SocketAddr::V6(_)) | Err(_) => Address::any(0),
    }
}

/// Reads `SO_ERROR` off a socket that just reported `EPOLLERR`/an error
/// readiness (§4.6's `handle_error`, grounded in `TcpConnection::handleError`
/// in `original_source/src/TcpConnection.cc`). Falls back to the syscall's
/// own failure if `getsockopt` itself can't be completed.
pub(crate) fn take_so_error(stream: &mio::net::TcpStream) -> io::Error {
    let mut optval: libc::c_int = 0;
    let mut optlen = mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            stream.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            std::ptr::addr_of_mut!(optval).cast(),
            &mut optlen,
        )
    };
    if rc != 0 {
        return io::Error::last_os_error();
    }
    io::Error::from_raw_os_error(optval)
}
