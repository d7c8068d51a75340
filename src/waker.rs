use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;

use crate::sys::eventfd::EventFd;

/// Wakes a selector from another thread.
///
/// The eventfd stays readable until drained, so a wake issued while the
/// selector is between waits is not lost.
#[derive(Debug, Clone)]
pub struct Waker {
    inner: Arc<EventFd>,
}

impl Waker {
    pub fn new() -> io::Result<Waker> {
        let eventfd = EventFd::new()?;

        Ok(Waker {
            inner: Arc::new(eventfd),
        })
    }

    pub fn wake(&self) -> io::Result<()> {
        match self.inner.write(1) {
            Ok(_) => Ok(()),
            Err(e) => {
                if e.kind() == io::ErrorKind::WouldBlock {
                    // counter saturated; the selector is overdue to wake anyway
                    Ok(())
                } else {
                    Err(e)
                }
            }
        }
    }

    pub fn drain(&self) -> io::Result<()> {
        match self.inner.read() {
            Ok(_) => Ok(()),
            Err(e) => {
                if e.kind() == io::ErrorKind::WouldBlock {
                    Ok(())
                } else {
                    Err(e)
                }
            }
        }
    }
}

impl AsRawFd for Waker {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}
