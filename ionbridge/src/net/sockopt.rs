//! Raw socket-option plumbing.
//!
//! tokio's socket types stop short of `SO_SNDBUF`/`SO_RCVBUF` reporting,
//! keep-alive idle times, and pre-bind `SO_REUSEADDR` for UDP, so these go
//! through `libc` on the raw fd.

use std::io;
use std::mem;
use std::net::SocketAddr;
use std::os::unix::io::{FromRawFd, RawFd};

fn setsockopt_i32(fd: RawFd, level: i32, name: i32, value: i32) -> io::Result<()> {
    let rc = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &value as *const i32 as *const libc::c_void,
            mem::size_of::<i32>() as libc::socklen_t,
        )
    };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

fn getsockopt_i32(fd: RawFd, level: i32, name: i32) -> io::Result<i32> {
    let mut value: i32 = 0;
    let mut len = mem::size_of::<i32>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            level,
            name,
            &mut value as *mut i32 as *mut libc::c_void,
            &mut len,
        )
    };
    if rc == 0 {
        Ok(value)
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Requests a send-buffer size and reports the value the platform adopted.
///
/// A `size` of zero only queries. Linux doubles the requested value for
/// bookkeeping; the adopted value is reported as-is.
pub fn send_buffer_size(fd: RawFd, size: i32) -> io::Result<i32> {
    if size > 0 {
        setsockopt_i32(fd, libc::SOL_SOCKET, libc::SO_SNDBUF, size)?;
    }
    getsockopt_i32(fd, libc::SOL_SOCKET, libc::SO_SNDBUF)
}

/// Requests a receive-buffer size and reports the adopted value.
pub fn recv_buffer_size(fd: RawFd, size: i32) -> io::Result<i32> {
    if size > 0 {
        setsockopt_i32(fd, libc::SOL_SOCKET, libc::SO_RCVBUF, size)?;
    }
    getsockopt_i32(fd, libc::SOL_SOCKET, libc::SO_RCVBUF)
}

/// Enables TCP keep-alive with the given idle time, or disables it when
/// `seconds` is zero.
pub fn set_keepalive(fd: RawFd, seconds: i32) -> io::Result<()> {
    if seconds == 0 {
        return setsockopt_i32(fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE, 0);
    }
    setsockopt_i32(fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE, 1)?;

    #[cfg(target_os = "linux")]
    setsockopt_i32(fd, libc::IPPROTO_TCP, libc::TCP_KEEPIDLE, seconds)?;
    #[cfg(target_os = "macos")]
    setsockopt_i32(fd, libc::IPPROTO_TCP, libc::TCP_KEEPALIVE, seconds)?;

    Ok(())
}

/// Half-closes the write side of a stream socket.
pub fn shutdown_write(fd: RawFd) -> io::Result<()> {
    let rc = unsafe { libc::shutdown(fd, libc::SHUT_WR) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Creates a UDP socket with `SO_REUSEADDR` set before binding.
pub fn bind_reuse_udp(addr: SocketAddr) -> io::Result<std::net::UdpSocket> {
    let family = if addr.is_ipv4() {
        libc::AF_INET
    } else {
        libc::AF_INET6
    };

    let fd = unsafe { libc::socket(family, libc::SOCK_DGRAM, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }

    let result = (|| {
        setsockopt_i32(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, 1)?;
        bind_fd(fd, addr)
    })();

    if let Err(error) = result {
        unsafe { libc::close(fd) };
        return Err(error);
    }

    let socket = unsafe { std::net::UdpSocket::from_raw_fd(fd) };
    socket.set_nonblocking(true)?;
    Ok(socket)
}

fn bind_fd(fd: RawFd, addr: SocketAddr) -> io::Result<()> {
    let rc = match addr {
        SocketAddr::V4(v4) => {
            let mut sin: libc::sockaddr_in = unsafe { mem::zeroed() };
            sin.sin_family = libc::AF_INET as libc::sa_family_t;
            sin.sin_port = v4.port().to_be();
            sin.sin_addr.s_addr = u32::from(*v4.ip()).to_be();
            unsafe {
                libc::bind(
                    fd,
                    &sin as *const libc::sockaddr_in as *const libc::sockaddr,
                    mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
                )
            }
        }
        SocketAddr::V6(v6) => {
            let mut sin6: libc::sockaddr_in6 = unsafe { mem::zeroed() };
            sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sin6.sin6_port = v6.port().to_be();
            sin6.sin6_addr.s6_addr = v6.ip().octets();
            unsafe {
                libc::bind(
                    fd,
                    &sin6 as *const libc::sockaddr_in6 as *const libc::sockaddr,
                    mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
                )
            }
        }
    };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}
