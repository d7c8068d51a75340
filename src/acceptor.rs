use std::io;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, trace, warn};

use crate::endpoint::Shared;
use crate::net::TcpListener;
use crate::ready::Ready;
use crate::sys;

/// How long one readiness wait on the listener may block. Bounds how late
/// the loop observes a pause or stop.
const ACCEPT_WAIT: Duration = Duration::from_millis(200);

const PAUSE_SLEEP: Duration = Duration::from_secs(1);

/// The accept loop.
///
/// Connections accepted here land in the kernel backlog while the endpoint
/// is paused and are drained after resume. No error thrown by a single
/// accept or socket setup may terminate the loop.
pub(crate) struct Acceptor {
    listener: TcpListener,
    shared: Arc<Shared>,
}

impl Acceptor {
    pub(crate) fn new(listener: TcpListener, shared: Arc<Shared>) -> Acceptor {
        Acceptor { listener, shared }
    }

    pub(crate) fn run(&self) {
        while self.shared.running.load(Ordering::Acquire) {
            if self.shared.paused.load(Ordering::Acquire) {
                thread::sleep(PAUSE_SLEEP);
                continue;
            }

            let readiness = match sys::poll::wait(
                self.listener.as_raw_fd(),
                Ready::readable(),
                Some(ACCEPT_WAIT),
            ) {
                Ok(readiness) => readiness,
                Err(e) => {
                    warn!("listener wait failed: {}", e);
                    continue;
                }
            };

            if !readiness.is_readable() {
                // timeout tick; re-check the flags
                continue;
            }

            if self.shared.paused.load(Ordering::Acquire)
                || !self.shared.running.load(Ordering::Acquire)
            {
                continue;
            }

            match self.listener.accept() {
                Ok((stream, addr)) => {
                    trace!("accepted connection from {}", addr);

                    if !self.shared.set_socket_options(stream) {
                        debug!("connection from {} refused during setup", addr);
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => warn!("accept failed: {}", e),
            }
        }

        trace!("acceptor thread exiting");
    }
}
