use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use libc::c_void;

/// An owned file descriptor, closed on drop.
#[derive(Debug)]
pub struct FileDesc(OwnedFd);

impl FileDesc {
    /// Takes ownership of `fd`. The caller must not close it elsewhere.
    pub fn new(fd: RawFd) -> FileDesc {
        FileDesc(unsafe { OwnedFd::from_raw_fd(fd) })
    }

    pub fn raw(&self) -> RawFd {
        self.0.as_raw_fd()
    }

    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let n = syscall!(read(self.raw(), buf.as_mut_ptr() as *mut c_void, buf.len()))?;
        Ok(n as usize)
    }

    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let n = syscall!(write(self.raw(), buf.as_ptr() as *const c_void, buf.len()))?;
        Ok(n as usize)
    }
}

impl AsRawFd for FileDesc {
    fn as_raw_fd(&self) -> RawFd {
        self.raw()
    }
}
