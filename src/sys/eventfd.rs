use std::io;
use std::os::unix::io::{AsRawFd, RawFd};

use super::fd::FileDesc;

/// A kernel event counter, used here as the selector wakeup primitive.
/// See <http://man7.org/linux/man-pages/man2/eventfd.2.html>
#[derive(Debug)]
pub struct EventFd {
    inner: FileDesc,
}

impl EventFd {
    /// Creates an eventfd with initval 0 and EFD_CLOEXEC | EFD_NONBLOCK.
    pub fn new() -> io::Result<EventFd> {
        let flags = libc::EFD_CLOEXEC | libc::EFD_NONBLOCK;
        let eventfd = syscall!(eventfd(0, flags))?;

        Ok(EventFd {
            inner: FileDesc::new(eventfd),
        })
    }

    pub fn read(&self) -> io::Result<u64> {
        let mut buf = [0u8; 8];
        self.inner.read(&mut buf)?;
        Ok(u64::from_ne_bytes(buf))
    }

    pub fn write(&self, val: u64) -> io::Result<()> {
        let buf: [u8; 8] = val.to_ne_bytes();
        self.inner.write(&buf)?;
        Ok(())
    }
}

impl AsRawFd for EventFd {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.raw()
    }
}

#[cfg(test)]
mod tests {
    use super::EventFd;

    #[test]
    fn write_and_read() {
        let eventfd = EventFd::new().unwrap();
        eventfd.write(123).unwrap();
        let count = eventfd.read().unwrap();
        assert_eq!(123, count);
    }

    #[test]
    fn write_block() {
        let eventfd = EventFd::new().unwrap();

        assert!(eventfd.write(0xfffffffffffffffe).is_ok());
        // counter saturated; a non-blocking write reports WouldBlock
        assert!(eventfd.write(0xfffffffffffffffe).is_err());
    }
}
