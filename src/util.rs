//! Non-blocking I/O drain helpers and raw socket plumbing.
//!
//! Everything here operates on raw descriptors because the poller and the
//! connection layer own their descriptors directly. All read/write helpers
//! follow the edge-triggered contract: drain until the kernel reports
//! would-block, never park in the middle of a readiness notification.

use bytes::{Buf, BytesMut};
use log::warn;
use std::io::{self, ErrorKind};
use std::os::unix::io::RawFd;

/// Chunk size for each read(2) call while draining a socket.
const MAX_BUFF: usize = 4096;

fn cvt(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

/// Monotonic clock in milliseconds. Timer expiries are computed and compared
/// against this clock only.
pub fn now_millis() -> i64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    ts.tv_sec as i64 * 1000 + ts.tv_nsec as i64 / 1_000_000
}

/// Create the wakeup descriptor for a reactor. An 8-byte write signals it, an
/// 8-byte read drains the counter.
pub fn create_eventfd() -> RawFd {
    let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
    assert!(fd >= 0, "failed to create eventfd: {}", io::Error::last_os_error());
    fd
}

/// Drain a non-blocking descriptor into `buf` until would-block.
///
/// Sets `peer_closed` when read(2) returns 0, meaning the peer shut down its
/// write side. Returns the number of bytes appended; an `Err` is a real
/// socket error, not would-block.
pub fn read_fd(fd: RawFd, buf: &mut BytesMut, peer_closed: &mut bool) -> io::Result<usize> {
    let mut total = 0usize;
    loop {
        let mut chunk = [0u8; MAX_BUFF];
        let n = unsafe { libc::read(fd, chunk.as_mut_ptr() as *mut libc::c_void, MAX_BUFF) };
        if n < 0 {
            let err = io::Error::last_os_error();
            match err.kind() {
                ErrorKind::Interrupted => continue,
                ErrorKind::WouldBlock => return Ok(total),
                _ => return Err(err),
            }
        }
        if n == 0 {
            *peer_closed = true;
            break;
        }
        total += n as usize;
        buf.extend_from_slice(&chunk[..n as usize]);
    }
    Ok(total)
}

/// Write as much of `buf` as the socket accepts, consuming the written
/// prefix. Stops at would-block; the caller re-asserts write interest for the
/// remainder.
pub fn write_fd(fd: RawFd, buf: &mut BytesMut) -> io::Result<usize> {
    let mut total = 0usize;
    while total < buf.len() {
        let rest = &buf[total..];
        let n = unsafe { libc::write(fd, rest.as_ptr() as *const libc::c_void, rest.len()) };
        if n < 0 {
            let err = io::Error::last_os_error();
            match err.kind() {
                ErrorKind::Interrupted => continue,
                ErrorKind::WouldBlock => break,
                _ => return Err(err),
            }
        }
        total += n as usize;
    }
    buf.advance(total);
    Ok(total)
}

/// Best-effort write of a byte slice, used for error pages that bypass the
/// outbound buffer. Short writes are not retried past would-block.
pub fn write_bytes(fd: RawFd, bytes: &[u8]) -> io::Result<usize> {
    let mut total = 0usize;
    while total < bytes.len() {
        let rest = &bytes[total..];
        let n = unsafe { libc::write(fd, rest.as_ptr() as *const libc::c_void, rest.len()) };
        if n < 0 {
            let err = io::Error::last_os_error();
            match err.kind() {
                ErrorKind::Interrupted => continue,
                ErrorKind::WouldBlock => break,
                _ => return Err(err),
            }
        }
        total += n as usize;
    }
    Ok(total)
}

/// Create an IPv4 listening socket bound to all interfaces with address
/// reuse enabled and a backlog of 2048.
pub fn socket_bind_listen(port: u16) -> io::Result<RawFd> {
    let listen_fd = cvt(unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) })?;

    let optval: libc::c_int = 1;
    if let Err(err) = cvt(unsafe {
        libc::setsockopt(
            listen_fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &optval as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    }) {
        unsafe { libc::close(listen_fd) };
        return Err(err);
    }

    let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    addr.sin_family = libc::AF_INET as libc::sa_family_t;
    addr.sin_addr.s_addr = libc::INADDR_ANY.to_be();
    addr.sin_port = port.to_be();
    if let Err(err) = cvt(unsafe {
        libc::bind(
            listen_fd,
            &addr as *const _ as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    }) {
        unsafe { libc::close(listen_fd) };
        return Err(err);
    }

    if let Err(err) = cvt(unsafe { libc::listen(listen_fd, 2048) }) {
        unsafe { libc::close(listen_fd) };
        return Err(err);
    }
    Ok(listen_fd)
}

/// Accept one pending connection. `Ok(None)` means the accept queue is
/// drained (would-block).
pub fn accept_conn(listen_fd: RawFd) -> io::Result<Option<(RawFd, std::net::SocketAddrV4)>> {
    let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    let fd = unsafe {
        libc::accept(
            listen_fd,
            &mut addr as *mut _ as *mut libc::sockaddr,
            &mut len,
        )
    };
    if fd < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == ErrorKind::WouldBlock {
            return Ok(None);
        }
        return Err(err);
    }
    let ip = std::net::Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
    let port = u16::from_be(addr.sin_port);
    Ok(Some((fd, std::net::SocketAddrV4::new(ip, port))))
}

pub fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = cvt(unsafe { libc::fcntl(fd, libc::F_GETFL, 0) })?;
    cvt(unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) })?;
    Ok(())
}

/// Disable the Nagle write-delay heuristic so small responses go out
/// immediately.
pub fn set_nodelay(fd: RawFd) {
    let enable: libc::c_int = 1;
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_NODELAY,
            &enable as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        warn!(
            "failed to set TCP_NODELAY on fd {}: {}",
            fd,
            io::Error::last_os_error()
        );
    }
}

/// Ignore SIGPIPE process-wide so writes to a half-closed peer surface as
/// EPIPE instead of killing the process.
pub fn ignore_sigpipe() {
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = libc::SIG_IGN;
        libc::sigaction(libc::SIGPIPE, &sa, std::ptr::null_mut());
    }
}
