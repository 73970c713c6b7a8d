use crate::macros::syscall;
use std::io;
use std::mem;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;

/// Listen backlog handed to `listen(2)`. The original hardcodes 1024;
/// kept as-is since no caller exposes it.
pub const LISTEN_BACKLOG: libc::c_int = 1024;

/// Creates a non-blocking, close-on-exec `AF_INET`/`AF_INET6` `SOCK_STREAM`
/// socket, matching `Socket::createNonblockingOrDie` minus the "or die" —
/// callers here get an `io::Error` instead of an abort, since socket
/// creation failure is not a programmer error.
pub fn new_socket(addr: &SocketAddr) -> io::Result<RawFd> {
    let domain = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };
    syscall!(socket(
        domain,
        libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        0,
    ))
}

pub fn set_reuse_addr(fd: RawFd, on: bool) -> io::Result<()> {
    set_bool_opt(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, on)
}

pub fn set_reuse_port(fd: RawFd, on: bool) -> io::Result<()> {
    set_bool_opt(fd, libc::SOL_SOCKET, libc::SO_REUSEPORT, on)
}

pub fn set_keep_alive(fd: RawFd, on: bool) -> io::Result<()> {
    set_bool_opt(fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE, on)
}

/// Disables Nagle's algorithm. `Connection` sets this unconditionally on
/// every accepted/connected socket, matching `TcpConnection`'s constructor.
pub fn set_tcp_nodelay(fd: RawFd, on: bool) -> io::Result<()> {
    set_bool_opt(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, on)
}

fn set_bool_opt(fd: RawFd, level: libc::c_int, name: libc::c_int, on: bool) -> io::Result<()> {
    let value: libc::c_int = on as libc::c_int;
    syscall!(setsockopt(
        fd,
        level,
        name,
        &value as *const libc::c_int as *const libc::c_void,
        mem::size_of::<libc::c_int>() as libc::socklen_t,
    ))
    .map(drop)
}

pub fn bind(fd: RawFd, addr: &SocketAddr) -> io::Result<()> {
    let (raw, len) = socket_addr_to_raw(addr);
    syscall!(bind(fd, &raw as *const _ as *const libc::sockaddr, len)).map(drop)
}

pub fn listen(fd: RawFd) -> io::Result<()> {
    syscall!(listen(fd, LISTEN_BACKLOG)).map(drop)
}

/// Accepts one connection with `accept4`, applying `SOCK_NONBLOCK |
/// SOCK_CLOEXEC` atomically instead of a separate `fcntl` pair.
pub fn accept(fd: RawFd) -> io::Result<(RawFd, SocketAddr)> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let conn_fd = syscall!(accept4(
        fd,
        &mut storage as *mut _ as *mut libc::sockaddr,
        &mut len,
        libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
    ))?;
    let addr = raw_to_socket_addr(&storage)?;
    Ok((conn_fd, addr))
}

/// Initiates a non-blocking `connect(2)`. The caller distinguishes
/// immediate success, `EINPROGRESS` (connection in flight, await
/// writability), and hard failures.
pub fn connect(fd: RawFd, addr: &SocketAddr) -> io::Result<()> {
    let (raw, len) = socket_addr_to_raw(addr);
    let res = unsafe { libc::connect(fd, &raw as *const _ as *const libc::sockaddr, len) };
    if res == 0 {
        return Ok(());
    }
    Err(io::Error::last_os_error())
}

pub fn local_addr(fd: RawFd) -> io::Result<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    syscall!(getsockname(
        fd,
        &mut storage as *mut _ as *mut libc::sockaddr,
        &mut len,
    ))?;
    raw_to_socket_addr(&storage)
}

pub fn peer_addr(fd: RawFd) -> io::Result<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    syscall!(getpeername(
        fd,
        &mut storage as *mut _ as *mut libc::sockaddr,
        &mut len,
    ))?;
    raw_to_socket_addr(&storage)
}

/// Writes `data` directly to `fd` with a single `write(2)`, without
/// retrying on a short write.
pub fn write_to_fd_direct(fd: RawFd, data: &[u8]) -> io::Result<usize> {
    syscall!(write(fd, data.as_ptr() as *const libc::c_void, data.len())).map(|n| n as usize)
}

/// Shuts down the write half only, used for the half-close path: the peer
/// still sees our outstanding writes drained and a FIN, but we keep reading
/// until it closes its own side.
pub fn shutdown_write(fd: RawFd) -> io::Result<()> {
    syscall!(shutdown(fd, libc::SHUT_WR)).map(drop)
}

/// Returns the pending error on a socket whose `connect(2)` just became
/// writable, distinguishing a completed connection from a failed one.
pub fn take_socket_error(fd: RawFd) -> io::Result<()> {
    let mut err: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    syscall!(getsockopt(
        fd,
        libc::SOL_SOCKET,
        libc::SO_ERROR,
        &mut err as *mut libc::c_int as *mut libc::c_void,
        &mut len,
    ))?;
    if err == 0 {
        Ok(())
    } else {
        Err(io::Error::from_raw_os_error(err))
    }
}

fn socket_addr_to_raw(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(v4) => {
            let raw = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe {
                let dst = &mut storage as *mut _ as *mut libc::sockaddr_in;
                *dst = raw;
            }
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t
        }
        SocketAddr::V6(v6) => {
            let raw = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: v6.scope_id(),
            };
            unsafe {
                let dst = &mut storage as *mut _ as *mut libc::sockaddr_in6;
                *dst = raw;
            }
            mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t
        }
    };
    (storage, len)
}

fn raw_to_socket_addr(storage: &libc::sockaddr_storage) -> io::Result<SocketAddr> {
    use std::net::{Ipv4Addr, Ipv6Addr, SocketAddrV4, SocketAddrV6};

    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let raw = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(u32::from_ne_bytes(raw.sin_addr.s_addr.to_ne_bytes()));
            let port = u16::from_be(raw.sin_port);
            Ok(SocketAddr::V4(SocketAddrV4::new(ip, port)))
        }
        libc::AF_INET6 => {
            let raw = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = Ipv6Addr::from(raw.sin6_addr.s6_addr);
            let port = u16::from_be(raw.sin6_port);
            Ok(SocketAddr::V6(SocketAddrV6::new(
                ip,
                port,
                raw.sin6_flowinfo,
                raw.sin6_scope_id,
            )))
        }
        family => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unsupported address family {family}"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn v4_round_trips_through_raw_sockaddr() {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 9000);
        let (raw, len) = socket_addr_to_raw(&addr);
        assert_eq!(len as usize, mem::size_of::<libc::sockaddr_in>());
        let back = raw_to_socket_addr(&raw).unwrap();
        assert_eq!(back, addr);
    }
}
