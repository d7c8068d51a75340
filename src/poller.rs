use std::net::Shutdown;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use std::{cmp, io, thread};

use log::{debug, error, trace};
use slab::Slab;

use crate::attachment::KeyAttachment;
use crate::endpoint::{Config, Dispatcher};
use crate::net::TcpStream;
use crate::queue::EventQueue;
use crate::ready::Ready;
use crate::socket::Socket;
use crate::sys::{Events, Selector};
use crate::token::Token;

/// Reserved for the ops queue's waker; connection tokens are slab keys and
/// can never collide with it.
const WAKE: Token = Token(usize::MAX);

/// A deferred selector action.
///
/// The selector is confined to the poller thread. Every other thread that
/// needs to touch selector state pushes one of these and lets the queue's
/// waker interrupt the wait; the poller applies ops in FIFO order at the top
/// of each iteration. Re-arm and cancel quote the registration id so an op
/// that raced a close cannot act on a recycled slot.
pub(crate) enum Op {
    Register(Arc<TcpStream>),
    Rearm { token: Token, id: u64 },
    Cancel { token: Token, id: u64 },
}

struct Registration {
    stream: Arc<TcpStream>,
    attachment: Arc<KeyAttachment>,
    interest: Ready,
    id: u64,
}

/// One selector and the thread that drives it.
///
/// Readiness is one-shot: delivery disables the registration, and the socket
/// will not re-fire until whoever received it re-arms. The idle scan runs
/// once per loop iteration over registrations whose interest is exactly
/// read, i.e. connections sitting in keep-alive rather than being processed.
pub struct Poller {
    inner: Arc<PollerInner>,
}

struct PollerInner {
    selector: Selector,
    ops: EventQueue<Op>,
    close: AtomicBool,
    keep_alive: AtomicUsize,
    next_id: AtomicU64,
    poller_size: usize,
    poll_time: Duration,
    selector_timeout: Duration,
    so_timeout: Option<Duration>,
    use_comet: bool,
}

impl Poller {
    pub(crate) fn new(config: &Config) -> io::Result<Poller> {
        let selector = Selector::new()?;
        let ops = EventQueue::unbounded()?;
        ops.register(&selector, WAKE)?;

        Ok(Poller {
            inner: Arc::new(PollerInner {
                selector,
                ops,
                close: AtomicBool::new(false),
                keep_alive: AtomicUsize::new(0),
                next_id: AtomicU64::new(0),
                poller_size: config.poller_size,
                poll_time: config.poll_time,
                selector_timeout: config.selector_timeout,
                so_timeout: config.so_timeout,
                use_comet: config.use_comet,
            }),
        })
    }

    /// Registered connections awaiting their next request.
    pub fn keep_alive_count(&self) -> usize {
        self.inner.keep_alive.load(Ordering::Relaxed)
    }

    /// Queues a new connection for registration with read interest.
    pub(crate) fn register(&self, stream: Arc<TcpStream>) -> bool {
        if self.inner.close.load(Ordering::Acquire) {
            return false;
        }

        self.inner.ops.push(Op::Register(stream)).is_ok()
    }

    /// Queues a re-arm: interest back to read, awaiting more client data.
    pub(crate) fn add(&self, token: Token, id: u64) {
        let _ = self.inner.ops.push(Op::Rearm { token, id });
    }

    /// Queues a cancellation; the registration is withdrawn and the stream
    /// shut down when the op is applied.
    pub(crate) fn cancel(&self, token: Token, id: u64) {
        let _ = self.inner.ops.push(Op::Cancel { token, id });
    }

    /// Lets an in-flight selection drain, then tells the poller thread to
    /// exit on its next iteration.
    pub(crate) fn destroy(&self) {
        thread::sleep(self.inner.poll_time);
        self.inner.close.store(true, Ordering::Release);
        let _ = self.inner.ops.wake();
    }

    pub(crate) fn run(&self, dispatcher: Dispatcher) {
        let mut registrations: Slab<Registration> =
            Slab::with_capacity(cmp::min(self.inner.poller_size, 1024));
        let mut events = Events::with_capacity(1024);

        loop {
            while let Ok(op) = self.inner.ops.pop() {
                self.apply(op, &mut registrations, &dispatcher);
            }

            if self.inner.close.load(Ordering::Acquire) {
                self.teardown(&mut registrations);
                break;
            }

            // an idle deadline must not sleep through a full selector wait
            let timeout = match self.inner.so_timeout {
                Some(t) => cmp::min(self.inner.selector_timeout, t),
                None => self.inner.selector_timeout,
            };

            if let Err(e) = self.inner.selector.select(&mut events, Some(timeout)) {
                error!("selector wait failed: {}", e);
                continue;
            }

            for i in 0..events.len() {
                let event = match events.get(i) {
                    Some(event) => event,
                    None => break,
                };

                if event.token() == WAKE {
                    // ops are drained at the top of every iteration
                    continue;
                }

                self.dispatch_event(
                    event.token(),
                    event.readiness(),
                    &mut registrations,
                    &dispatcher,
                );
            }

            self.idle_scan(&mut registrations, &dispatcher);
        }

        trace!("poller thread exiting");
    }

    fn apply(&self, op: Op, registrations: &mut Slab<Registration>, dispatcher: &Dispatcher) {
        match op {
            Op::Register(stream) => {
                if registrations.len() >= self.inner.poller_size {
                    error!(
                        "poller at capacity ({} connections); rejecting",
                        self.inner.poller_size
                    );
                    let _ = stream.shutdown(Shutdown::Both);
                    return;
                }

                let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
                let entry = registrations.vacant_entry();
                let token = Token(entry.key());
                let fd = stream.as_raw_fd();

                match self.inner.selector.add(fd, token, Ready::readable(), true) {
                    Ok(()) => {
                        entry.insert(Registration {
                            stream,
                            attachment: Arc::new(KeyAttachment::new()),
                            interest: Ready::readable(),
                            id,
                        });
                        self.inner
                            .keep_alive
                            .store(registrations.len(), Ordering::Relaxed);
                        trace!("registered connection as {:?}", token);
                    }
                    Err(e) => {
                        debug!("selector registration failed: {}", e);
                        let _ = stream.shutdown(Shutdown::Both);
                    }
                }
            }
            Op::Rearm { token, id } => {
                let failed = match registrations.get_mut(token.0) {
                    Some(reg) if reg.id == id => {
                        reg.attachment.access();
                        match self.inner.selector.modify(
                            reg.stream.as_raw_fd(),
                            token,
                            Ready::readable(),
                            true,
                        ) {
                            Ok(()) => {
                                reg.interest = Ready::readable();
                                false
                            }
                            Err(e) => {
                                debug!("re-arm failed for {:?}: {}", token, e);
                                true
                            }
                        }
                    }
                    // stale op against a cancelled or recycled slot
                    _ => false,
                };

                if failed {
                    self.cancelled_key(token, id, registrations, dispatcher, false);
                }
            }
            Op::Cancel { token, id } => {
                self.cancelled_key(token, id, registrations, dispatcher, false);
            }
        }
    }

    fn dispatch_event(
        &self,
        token: Token,
        readiness: Ready,
        registrations: &mut Slab<Registration>,
        dispatcher: &Dispatcher,
    ) {
        let (stream, attachment, id) = match registrations.get_mut(token.0) {
            Some(reg) => {
                reg.attachment.access();
                // one-shot delivery: the kernel disabled the registration
                reg.interest = reg.interest - readiness;
                (reg.stream.clone(), reg.attachment.clone(), reg.id)
            }
            // cancelled while the event was in flight
            None => return,
        };

        if readiness.is_readable() {
            if attachment.take_wake_up() {
                // long-poll park release; the parked thread owns the socket
                attachment.unpark();
                return;
            }

            attachment.set_current_access(true);
            let socket = Socket::new(stream, token, id, attachment.clone(), self.clone());

            if self.inner.use_comet && attachment.is_comet() {
                if !dispatcher.process_socket_event(socket.clone(), false)
                    && !dispatcher.process_socket_event(socket, true)
                {
                    self.cancelled_key(token, id, registrations, dispatcher, false);
                }
            } else if !dispatcher.process_socket(socket) {
                debug!("dispatch failed for {:?}; closing", token);
                self.cancelled_key(token, id, registrations, dispatcher, false);
            }
        } else if readiness.is_error() || readiness.is_hup() {
            self.cancelled_key(token, id, registrations, dispatcher, true);
        }
        // writable-only readiness: nothing arms write interest in this
        // release, so there is nothing to do here yet
    }

    /// Withdraws a registration: selector delete, parked waiters released,
    /// a long-poll error event delivered when `error_event` asks for one,
    /// then the stream is shut down.
    fn cancelled_key(
        &self,
        token: Token,
        id: u64,
        registrations: &mut Slab<Registration>,
        dispatcher: &Dispatcher,
        error_event: bool,
    ) {
        let current = registrations.get(token.0).map(|reg| reg.id);
        if current != Some(id) {
            return;
        }
        let reg = registrations.remove(token.0);

        let _ = self.inner.selector.delete(reg.stream.as_raw_fd());
        self.inner
            .keep_alive
            .store(registrations.len(), Ordering::Relaxed);

        reg.attachment.unpark();

        if error_event && self.inner.use_comet && reg.attachment.is_comet() {
            let socket = Socket::new(
                reg.stream.clone(),
                token,
                id,
                reg.attachment.clone(),
                self.clone(),
            );
            dispatcher.process_socket_event(socket, true);
        }

        let _ = reg.stream.shutdown(Shutdown::Both);
    }

    fn idle_scan(&self, registrations: &mut Slab<Registration>, dispatcher: &Dispatcher) {
        let timeout = match self.inner.so_timeout {
            Some(timeout) => timeout,
            None => return,
        };

        let mut expired = Vec::new();

        for (key, reg) in registrations.iter() {
            // interest exactly read means keep-alive: connections being
            // processed had their interest cleared on dispatch and are exempt
            if reg.interest == Ready::readable() && reg.attachment.idle_for() > timeout {
                expired.push((Token(key), reg.id));
            }
        }

        for (token, id) in expired {
            debug!("idle timeout on {:?}", token);
            self.cancelled_key(token, id, registrations, dispatcher, true);
        }
    }

    fn teardown(&self, registrations: &mut Slab<Registration>) {
        self.inner.ops.close();

        while let Ok(op) = self.inner.ops.pop() {
            if let Op::Register(stream) = op {
                let _ = stream.shutdown(Shutdown::Both);
            }
        }

        for (_, reg) in registrations.iter() {
            let _ = self.inner.selector.delete(reg.stream.as_raw_fd());
            reg.attachment.unpark();

            // only close what the poller owns: armed keep-alive
            // registrations. A connection whose interest was cleared on
            // dispatch belongs to a worker until it closes or re-arms.
            if reg.interest == Ready::readable() {
                let _ = reg.stream.shutdown(Shutdown::Both);
            }
        }

        registrations.clear();
        self.inner.keep_alive.store(0, Ordering::Relaxed);
    }
}

impl Clone for Poller {
    fn clone(&self) -> Poller {
        Poller {
            inner: self.inner.clone(),
        }
    }
}
