use std::net::{self, SocketAddr};
use std::os::unix::io::{FromRawFd, RawFd};
use std::time::Duration;
use std::{cmp, io, mem};

use libc::{c_int, c_void};

pub fn setsockopt<T>(fd: RawFd, level: c_int, name: c_int, payload: T) -> io::Result<()> {
    let payload = &payload as *const T as *const c_void;
    syscall!(setsockopt(
        fd,
        level,
        name,
        payload,
        mem::size_of::<T>() as libc::socklen_t
    ))?;
    Ok(())
}

/// Binds a listening socket with an explicit accept backlog.
///
/// `std::net::TcpListener::bind` hard-codes its backlog, so the socket is
/// built by hand and only then handed to std for accept bookkeeping.
pub fn bind(addr: SocketAddr, backlog: i32) -> io::Result<net::TcpListener> {
    let fam = match addr {
        SocketAddr::V4(..) => libc::AF_INET,
        SocketAddr::V6(..) => libc::AF_INET6,
    };

    let fd = syscall!(socket(fam, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0))?;
    // ownership moves to the listener; errors below close the fd on drop
    let listener = unsafe { net::TcpListener::from_raw_fd(fd) };

    setsockopt(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, 1 as c_int)?;

    let (storage, len) = addr_to_raw(&addr);
    syscall!(bind(fd, &storage as *const _ as *const libc::sockaddr, len))?;
    syscall!(listen(fd, backlog))?;

    Ok(listener)
}

fn addr_to_raw(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };

    let len = match addr {
        SocketAddr::V4(a) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: a.port().to_be(),
                sin_addr: libc::in_addr {
                    // octets are already network order
                    s_addr: u32::from_ne_bytes(a.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe { *(&mut storage as *mut _ as *mut libc::sockaddr_in) = sin };
            mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(a) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: a.port().to_be(),
                sin6_flowinfo: a.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: a.ip().octets(),
                },
                sin6_scope_id: a.scope_id(),
            };
            unsafe { *(&mut storage as *mut _ as *mut libc::sockaddr_in6) = sin6 };
            mem::size_of::<libc::sockaddr_in6>()
        }
    };

    (storage, len as libc::socklen_t)
}

/// SO_LINGER with the given timeout; `None` leaves lingering disabled.
pub fn set_linger(fd: RawFd, dur: Option<Duration>) -> io::Result<()> {
    let linger = libc::linger {
        l_onoff: dur.is_some() as c_int,
        l_linger: dur
            .map(|d| cmp::min(d.as_secs(), c_int::MAX as u64) as c_int)
            .unwrap_or(0),
    };

    setsockopt(fd, libc::SOL_SOCKET, libc::SO_LINGER, linger)
}

/// SO_RCVTIMEO; `None` clears the timeout.
pub fn set_recv_timeout(fd: RawFd, dur: Option<Duration>) -> io::Result<()> {
    let timeout = match dur {
        Some(dur) => {
            let mut timeout = libc::timeval {
                tv_sec: cmp::min(dur.as_secs(), libc::time_t::MAX as u64) as libc::time_t,
                tv_usec: dur.subsec_micros() as libc::suseconds_t,
            };
            if timeout.tv_sec == 0 && timeout.tv_usec == 0 {
                timeout.tv_usec = 1;
            }
            timeout
        }
        None => libc::timeval {
            tv_sec: 0,
            tv_usec: 0,
        },
    };

    setsockopt(fd, libc::SOL_SOCKET, libc::SO_RCVTIMEO, timeout)
}
