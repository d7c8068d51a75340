use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use crate::attachment::KeyAttachment;
use crate::net::TcpStream;
use crate::poller::Poller;
use crate::token::Token;

/// A dispatched connection.
///
/// Handed to [`Handler`](crate::Handler) calls and cheap to clone: a handler
/// that returns [`SocketState::Long`](crate::SocketState) keeps a clone and
/// re-arms or closes it later, possibly from another thread. Between
/// delivery and the next `rearm` the poller will not touch the connection;
/// whoever holds the socket owns it.
#[derive(Clone)]
pub struct Socket {
    stream: Arc<TcpStream>,
    token: Token,
    id: u64,
    attachment: Arc<KeyAttachment>,
    poller: Poller,
}

impl Socket {
    pub(crate) fn new(
        stream: Arc<TcpStream>,
        token: Token,
        id: u64,
        attachment: Arc<KeyAttachment>,
        poller: Poller,
    ) -> Socket {
        Socket {
            stream,
            token,
            id,
            attachment,
            poller,
        }
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.stream.local_addr()
    }

    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    pub fn attachment(&self) -> &KeyAttachment {
        &self.attachment
    }

    /// Marks the connection for long-poll delivery: subsequent readiness is
    /// dispatched through [`Handler::event`](crate::Handler::event).
    pub fn set_comet(&self, comet: bool) {
        self.attachment.set_comet(comet);
    }

    pub fn is_comet(&self) -> bool {
        self.attachment.is_comet()
    }

    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        (&*self.stream).read(buf)
    }

    /// Writes the whole buffer, spinning briefly on `WouldBlock`. The socket
    /// is non-blocking; callers that cannot tolerate the retry loop should
    /// write through [`stream`](Socket::stream) directly.
    pub fn write(&self, buf: &[u8]) -> io::Result<()> {
        let mut written = 0;

        while written < buf.len() {
            match (&*self.stream).write(&buf[written..]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => written += n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::yield_now();
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    /// Returns the connection to the poller awaiting more client data.
    pub fn rearm(&self) {
        self.attachment.set_wake_up(false);
        self.attachment.set_current_access(false);
        self.poller.add(self.token, self.id);
    }

    /// Parks the calling thread until the next readiness on this connection.
    ///
    /// Arms the wake-up flag, re-arms read interest, then blocks; the poller
    /// releases the parker instead of dispatching. Returns false on timeout,
    /// in which case the wake-up flag may still be armed and the caller
    /// should close the connection.
    pub fn park(&self, timeout: Option<Duration>) -> bool {
        self.attachment.set_wake_up(true);
        self.poller.add(self.token, self.id);
        self.attachment.park(timeout)
    }

    /// Closes the connection and withdraws it from the poller.
    pub fn close(&self) {
        let _ = self.stream.shutdown(Shutdown::Both);
        self.poller.cancel(self.token, self.id);
    }
}

impl Read for &Socket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (&*self.stream).read(buf)
    }
}

impl Write for &Socket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (&*self.stream).write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        (&*self.stream).flush()
    }
}
