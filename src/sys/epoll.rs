use std::cmp;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use libc::{self, c_int};
use libc::{EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLONESHOT, EPOLLOUT, EPOLLPRI, EPOLLRDHUP};

use crate::ready::Ready;
use crate::token::Token;

/// The OS readiness notifier backing a poller.
///
/// All registrations are level-triggered; a registration made with
/// `oneshot = true` is disabled by the kernel after its first event and stays
/// silent (including for error and hang-up conditions) until `modify` re-arms
/// it.
pub struct Selector {
    epfd: RawFd,
}

impl Selector {
    pub fn new() -> io::Result<Selector> {
        let epfd = syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?;

        Ok(Selector { epfd })
    }

    /// Blocks until at least one registration is ready or `timeout` elapses.
    /// An interrupted wait is reported as zero events.
    pub fn select(&self, evts: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        let timeout = timeout
            .map(|to| cmp::min(to.as_millis(), libc::c_int::MAX as u128) as libc::c_int)
            .unwrap_or(-1);

        evts.events.clear();

        let cnt = match syscall!(epoll_wait(
            self.epfd,
            evts.events.as_mut_ptr(),
            evts.events.capacity() as i32,
            timeout
        )) {
            Ok(cnt) => cnt,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => 0,
            Err(e) => return Err(e),
        };

        unsafe { evts.events.set_len(cnt as usize) };

        Ok(())
    }

    pub fn add(&self, fd: RawFd, token: Token, interest: Ready, oneshot: bool) -> io::Result<()> {
        let mut info = libc::epoll_event {
            events: interest_to_epoll(interest, oneshot),
            u64: usize::from(token) as u64,
        };

        syscall!(epoll_ctl(self.epfd, libc::EPOLL_CTL_ADD, fd, &mut info))?;

        Ok(())
    }

    pub fn modify(&self, fd: RawFd, token: Token, interest: Ready, oneshot: bool) -> io::Result<()> {
        let mut info = libc::epoll_event {
            events: interest_to_epoll(interest, oneshot),
            u64: usize::from(token) as u64,
        };

        syscall!(epoll_ctl(self.epfd, libc::EPOLL_CTL_MOD, fd, &mut info))?;

        Ok(())
    }

    pub fn delete(&self, fd: RawFd) -> io::Result<()> {
        let mut info = libc::epoll_event { events: 0, u64: 0 };

        syscall!(epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, &mut info))?;

        Ok(())
    }
}

fn interest_to_epoll(interest: Ready, oneshot: bool) -> u32 {
    let mut kind = 0;

    if interest.is_readable() {
        kind |= EPOLLIN;
    }

    if interest.is_writable() {
        kind |= EPOLLOUT;
    }

    if oneshot {
        kind |= EPOLLONESHOT;
    }

    kind as u32
}

impl AsRawFd for Selector {
    fn as_raw_fd(&self) -> RawFd {
        self.epfd
    }
}

impl Drop for Selector {
    fn drop(&mut self) {
        unsafe {
            let _ = libc::close(self.epfd);
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Event {
    readiness: Ready,
    token: Token,
}

impl Event {
    pub fn readiness(&self) -> Ready {
        self.readiness
    }

    pub fn token(&self) -> Token {
        self.token
    }
}

pub struct Events {
    events: Vec<libc::epoll_event>,
}

impl Events {
    pub fn with_capacity(u: usize) -> Events {
        Events {
            events: Vec::with_capacity(u),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    #[inline]
    pub fn get(&self, idx: usize) -> Option<Event> {
        self.events.get(idx).map(|event| {
            let epoll = event.events as c_int;
            let mut readiness = Ready::empty();

            if (epoll & EPOLLIN) != 0 || (epoll & EPOLLPRI) != 0 {
                readiness.insert(Ready::readable());
            }

            if (epoll & EPOLLOUT) != 0 {
                readiness.insert(Ready::writable());
            }

            // EPOLLERR usually means a socket error is pending
            if (epoll & EPOLLERR) != 0 {
                readiness.insert(Ready::error());
            }

            if (epoll & EPOLLRDHUP) != 0 || (epoll & EPOLLHUP) != 0 {
                readiness.insert(Ready::hup());
            }

            Event {
                readiness,
                token: Token(event.u64 as usize),
            }
        })
    }
}
