use std::os::unix::io::RawFd;
use std::time::Duration;
use std::{cmp, io};

use crate::ready::Ready;

/// Waits for `readiness` on a single descriptor, bounded by `timeout`.
///
/// An interrupted or timed-out wait returns an empty set; the caller is
/// expected to re-check its own predicates and retry.
pub fn wait(fd: RawFd, readiness: Ready, timeout: Option<Duration>) -> io::Result<Ready> {
    let timeout = timeout
        .map(|to| cmp::min(to.as_millis(), libc::c_int::MAX as u128) as libc::c_int)
        .unwrap_or(-1);

    let mut pollfd = libc::pollfd {
        fd,
        events: ready_to_poll(readiness),
        revents: 0,
    };

    let ret = unsafe { libc::poll(&mut pollfd, 1, timeout) };
    if ret < 0 {
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }

    Ok(poll_to_ready(pollfd.revents))
}

fn ready_to_poll(readiness: Ready) -> libc::c_short {
    let mut events = 0;

    if readiness.is_readable() {
        events |= libc::POLLIN;
    }

    if readiness.is_writable() {
        events |= libc::POLLOUT;
    }

    events
}

fn poll_to_ready(events: libc::c_short) -> Ready {
    let mut readiness = Ready::empty();

    if events & libc::POLLIN != 0 {
        readiness.insert(Ready::readable());
    }

    if events & libc::POLLOUT != 0 {
        readiness.insert(Ready::writable());
    }

    if events & libc::POLLERR != 0 {
        readiness.insert(Ready::error());
    }

    if events & libc::POLLHUP != 0 {
        readiness.insert(Ready::hup());
    }

    readiness
}
