//! Thin wrappers over the raw socket, eventfd and timerfd syscalls.
//!
//! Everything here returns `io::Result` with the errno preserved; policy
//! (retry classes, EMFILE handling, fatal-vs-transient) lives in the callers.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

/// Floor applied when arming the timerfd. Anything shorter is rounded up so
/// a zero or negative relative expiration still produces a wakeup.
pub(crate) const TIMER_RESOLUTION: Duration = Duration::from_micros(100);

fn cvt(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

fn cvt_isize(ret: isize) -> io::Result<usize> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret as usize)
    }
}

/// Create a non-blocking, close-on-exec TCP socket for the given family.
pub(crate) fn tcp_socket(ipv6: bool) -> io::Result<OwnedFd> {
    let domain = if ipv6 { libc::AF_INET6 } else { libc::AF_INET };
    let fd = cvt(unsafe {
        libc::socket(
            domain,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            libc::IPPROTO_TCP,
        )
    })?;
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Convert a `SocketAddr` into sockaddr_storage + length for bind/connect.
fn sockaddr_storage(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(v4) => {
            let sa = &mut storage as *mut _ as *mut libc::sockaddr_in;
            unsafe {
                (*sa).sin_family = libc::AF_INET as libc::sa_family_t;
                (*sa).sin_port = v4.port().to_be();
                (*sa).sin_addr.s_addr = u32::from_ne_bytes(v4.ip().octets());
            }
            std::mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(v6) => {
            let sa = &mut storage as *mut _ as *mut libc::sockaddr_in6;
            unsafe {
                (*sa).sin6_family = libc::AF_INET6 as libc::sa_family_t;
                (*sa).sin6_port = v6.port().to_be();
                (*sa).sin6_flowinfo = v6.flowinfo();
                (*sa).sin6_addr.s6_addr = v6.ip().octets();
                (*sa).sin6_scope_id = v6.scope_id();
            }
            std::mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as libc::socklen_t)
}

/// Convert a kernel-filled sockaddr_storage back into a `SocketAddr`.
fn sockaddr_from_storage(storage: &libc::sockaddr_storage) -> io::Result<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let sa = storage as *const _ as *const libc::sockaddr_in;
            let (ip, port) = unsafe {
                (
                    Ipv4Addr::from((*sa).sin_addr.s_addr.to_ne_bytes()),
                    u16::from_be((*sa).sin_port),
                )
            };
            Ok(SocketAddr::V4(SocketAddrV4::new(ip, port)))
        }
        libc::AF_INET6 => {
            let sa = storage as *const _ as *const libc::sockaddr_in6;
            let addr = unsafe {
                SocketAddrV6::new(
                    Ipv6Addr::from((*sa).sin6_addr.s6_addr),
                    u16::from_be((*sa).sin6_port),
                    (*sa).sin6_flowinfo,
                    (*sa).sin6_scope_id,
                )
            };
            Ok(SocketAddr::V6(addr))
        }
        family => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unexpected address family {family}"),
        )),
    }
}

pub(crate) fn bind(fd: RawFd, addr: &SocketAddr) -> io::Result<()> {
    let (storage, len) = sockaddr_storage(addr);
    cvt(unsafe { libc::bind(fd, &storage as *const _ as *const libc::sockaddr, len) })?;
    Ok(())
}

pub(crate) fn listen(fd: RawFd, backlog: i32) -> io::Result<()> {
    cvt(unsafe { libc::listen(fd, backlog) })?;
    Ok(())
}

/// Accept one connection. The returned fd is non-blocking and close-on-exec.
pub(crate) fn accept(fd: RawFd) -> io::Result<(OwnedFd, SocketAddr)> {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let conn = cvt(unsafe {
        libc::accept4(
            fd,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        )
    })?;
    let conn = unsafe { OwnedFd::from_raw_fd(conn) };
    let peer = sockaddr_from_storage(&storage)?;
    Ok((conn, peer))
}

/// Issue a non-blocking connect. Returns the raw errno (0 on immediate
/// success) so the connector can classify it without losing information.
pub(crate) fn connect(fd: RawFd, addr: &SocketAddr) -> i32 {
    let (storage, len) = sockaddr_storage(addr);
    let ret = unsafe { libc::connect(fd, &storage as *const _ as *const libc::sockaddr, len) };
    if ret == 0 {
        0
    } else {
        io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO)
    }
}

pub(crate) fn shutdown_write(fd: RawFd) -> io::Result<()> {
    cvt(unsafe { libc::shutdown(fd, libc::SHUT_WR) })?;
    Ok(())
}

pub(crate) fn write(fd: RawFd, data: &[u8]) -> io::Result<usize> {
    cvt_isize(unsafe { libc::write(fd, data.as_ptr() as *const libc::c_void, data.len()) })
}

/// Scatter-read into two buffers with a single syscall.
pub(crate) fn readv2(fd: RawFd, first: &mut [u8], second: &mut [u8]) -> io::Result<usize> {
    let iov = [
        libc::iovec {
            iov_base: first.as_mut_ptr() as *mut libc::c_void,
            iov_len: first.len(),
        },
        libc::iovec {
            iov_base: second.as_mut_ptr() as *mut libc::c_void,
            iov_len: second.len(),
        },
    ];
    let iovcnt = if first.is_empty() { 1 } else { 2 };
    let iov_ptr = if first.is_empty() { &iov[1] } else { &iov[0] };
    cvt_isize(unsafe { libc::readv(fd, iov_ptr, iovcnt) })
}

/// Read the pending SO_ERROR from a socket. Returns the errno value, or the
/// getsockopt errno itself if the query fails.
pub(crate) fn socket_error(fd: RawFd) -> i32 {
    let mut err: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if ret < 0 {
        io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO)
    } else {
        err
    }
}

fn set_bool_opt(fd: RawFd, level: libc::c_int, opt: libc::c_int, on: bool) -> io::Result<()> {
    let val: libc::c_int = if on { 1 } else { 0 };
    cvt(unsafe {
        libc::setsockopt(
            fd,
            level,
            opt,
            &val as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    })?;
    Ok(())
}

pub(crate) fn set_reuse_addr(fd: RawFd, on: bool) -> io::Result<()> {
    set_bool_opt(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, on)
}

pub(crate) fn set_reuse_port(fd: RawFd, on: bool) -> io::Result<()> {
    set_bool_opt(fd, libc::SOL_SOCKET, libc::SO_REUSEPORT, on)
}

pub(crate) fn set_keep_alive(fd: RawFd, on: bool) -> io::Result<()> {
    set_bool_opt(fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE, on)
}

pub(crate) fn set_tcp_nodelay(fd: RawFd, on: bool) -> io::Result<()> {
    set_bool_opt(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, on)
}

pub(crate) fn local_addr(fd: RawFd) -> io::Result<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    cvt(unsafe { libc::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len) })?;
    sockaddr_from_storage(&storage)
}

pub(crate) fn peer_addr(fd: RawFd) -> io::Result<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    cvt(unsafe { libc::getpeername(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len) })?;
    sockaddr_from_storage(&storage)
}

/// TCP self-connect: the kernel picked an ephemeral source port equal to the
/// destination, so the socket's peer is itself.
pub(crate) fn is_self_connect(fd: RawFd) -> bool {
    match (local_addr(fd), peer_addr(fd)) {
        (Ok(local), Ok(peer)) => local == peer,
        _ => false,
    }
}

/// Create a bound, non-blocking listening socket. Returns the socket and the
/// actual local address (resolving port 0).
pub(crate) fn listen_socket(
    addr: &SocketAddr,
    reuse_port: bool,
) -> io::Result<(OwnedFd, SocketAddr)> {
    let sock = tcp_socket(addr.is_ipv6())?;
    set_reuse_addr(sock.as_raw_fd(), true)?;
    if reuse_port {
        set_reuse_port(sock.as_raw_fd(), true)?;
    }
    bind(sock.as_raw_fd(), addr)?;
    let local = local_addr(sock.as_raw_fd())?;
    Ok((sock, local))
}

// --- eventfd ---

pub(crate) fn eventfd() -> io::Result<OwnedFd> {
    let fd = cvt(unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) })?;
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

pub(crate) fn eventfd_write(fd: RawFd) -> io::Result<()> {
    let val: u64 = 1;
    cvt_isize(unsafe { libc::write(fd, &val as *const u64 as *const libc::c_void, 8) })?;
    Ok(())
}

pub(crate) fn eventfd_read(fd: RawFd) -> io::Result<u64> {
    let mut val: u64 = 0;
    cvt_isize(unsafe { libc::read(fd, &mut val as *mut u64 as *mut libc::c_void, 8) })?;
    Ok(val)
}

// --- timerfd ---

pub(crate) fn timerfd() -> io::Result<OwnedFd> {
    let fd = cvt(unsafe {
        libc::timerfd_create(
            libc::CLOCK_MONOTONIC,
            libc::TFD_NONBLOCK | libc::TFD_CLOEXEC,
        )
    })?;
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Arm the timerfd to fire once after `delay` (floored to the scheduling
/// resolution). A zero `it_value` would disarm, hence the floor.
pub(crate) fn timerfd_arm(fd: RawFd, delay: Duration) -> io::Result<()> {
    let delay = delay.max(TIMER_RESOLUTION);
    let spec = libc::itimerspec {
        it_interval: libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        },
        it_value: libc::timespec {
            tv_sec: delay.as_secs() as libc::time_t,
            tv_nsec: delay.subsec_nanos() as libc::c_long,
        },
    };
    cvt(unsafe { libc::timerfd_settime(fd, 0, &spec, std::ptr::null_mut()) })?;
    Ok(())
}

pub(crate) fn timerfd_disarm(fd: RawFd) -> io::Result<()> {
    let spec: libc::itimerspec = unsafe { std::mem::zeroed() };
    cvt(unsafe { libc::timerfd_settime(fd, 0, &spec, std::ptr::null_mut()) })?;
    Ok(())
}

/// Drain the timerfd expiration counter.
pub(crate) fn timerfd_read(fd: RawFd) -> io::Result<u64> {
    let mut count: u64 = 0;
    cvt_isize(unsafe { libc::read(fd, &mut count as *mut u64 as *mut libc::c_void, 8) })?;
    Ok(count)
}

/// Reserve an fd against EMFILE (the acceptor's /dev/null slot).
pub(crate) fn open_dev_null() -> io::Result<OwnedFd> {
    let fd = cvt(unsafe { libc::open(c"/dev/null".as_ptr(), libc::O_RDONLY | libc::O_CLOEXEC) })?;
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}
