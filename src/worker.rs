use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use log::{debug, error, trace};

use crate::handler::{Handler, SocketState};
use crate::socket::Socket;

/// A unit of work handed to a worker (or to an external executor task).
pub(crate) enum Dispatch {
    Process(Socket),
    Event { socket: Socket, error: bool },
    Shutdown,
}

/// Runs one dispatch to completion: invoke the handler, then act on the
/// returned state. A handler panic is contained and closes the connection;
/// it never takes the calling thread down.
pub(crate) fn execute_dispatch(handler: &dyn Handler, running: &AtomicBool, dispatch: Dispatch) {
    match dispatch {
        Dispatch::Shutdown => {}
        Dispatch::Process(socket) => {
            if !running.load(Ordering::Acquire) {
                socket.close();
                return;
            }
            let state = panic::catch_unwind(AssertUnwindSafe(|| handler.process(&socket)));
            finish(socket, state);
        }
        Dispatch::Event { socket, error } => {
            if !running.load(Ordering::Acquire) {
                socket.close();
                return;
            }
            let state = panic::catch_unwind(AssertUnwindSafe(|| handler.event(&socket, error)));
            finish(socket, state);
        }
    }
}

fn finish(socket: Socket, state: thread::Result<SocketState>) {
    match state {
        Ok(SocketState::Open) => socket.rearm(),
        Ok(SocketState::Closed) => socket.close(),
        Ok(SocketState::Long) => {}
        Err(_) => {
            debug!("handler panicked; closing connection");
            socket.close();
        }
    }
}

/// A one-slot rendezvous between a producer and a single worker.
///
/// The producer blocks while the slot is occupied; the worker blocks while
/// it is empty. One hand-off per notify, so a worker can neither lose an
/// assigned socket nor receive two at once.
struct Mailbox {
    slot: Mutex<Option<Dispatch>>,
    cond: Condvar,
}

impl Mailbox {
    fn new() -> Mailbox {
        Mailbox {
            slot: Mutex::new(None),
            cond: Condvar::new(),
        }
    }

    fn assign(&self, dispatch: Dispatch) {
        let mut slot = self.slot.lock().unwrap();

        while slot.is_some() {
            slot = self.cond.wait(slot).unwrap();
        }

        *slot = Some(dispatch);
        self.cond.notify_all();
    }

    fn take(&self) -> Dispatch {
        let mut slot = self.slot.lock().unwrap();

        loop {
            if let Some(dispatch) = slot.take() {
                self.cond.notify_all();
                return dispatch;
            }

            slot = self.cond.wait(slot).unwrap();
        }
    }
}

#[derive(Clone)]
pub(crate) struct WorkerHandle {
    mailbox: Arc<Mailbox>,
}

impl WorkerHandle {
    pub(crate) fn assign(&self, dispatch: Dispatch) {
        self.mailbox.assign(dispatch);
    }
}

/// A bounded LIFO stack of idle workers.
///
/// Grows lazily up to `max_threads` (unbounded when negative) and blocks
/// requesters while saturated; this is the endpoint's back-pressure point.
/// The stack is LIFO so the most recently parked worker, with the warmest
/// cache, is reused first.
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    state: Mutex<PoolState>,
    returned: Condvar,
    max_threads: i64,
    name: String,
    running: Arc<AtomicBool>,
    handler: Arc<dyn Handler>,
}

struct PoolState {
    idle: Vec<WorkerHandle>,
    current: usize,
    busy: usize,
    open: bool,
    next_id: usize,
}

impl WorkerPool {
    pub(crate) fn new(
        max_threads: i64,
        name: &str,
        handler: Arc<dyn Handler>,
        running: Arc<AtomicBool>,
    ) -> WorkerPool {
        WorkerPool {
            inner: Arc::new(PoolInner {
                state: Mutex::new(PoolState {
                    idle: Vec::new(),
                    current: 0,
                    busy: 0,
                    open: true,
                    next_id: 0,
                }),
                returned: Condvar::new(),
                max_threads,
                name: name.to_string(),
                running,
                handler,
            }),
        }
    }

    pub fn current_thread_count(&self) -> usize {
        self.inner.state.lock().unwrap().current
    }

    pub fn current_threads_busy(&self) -> usize {
        self.inner.state.lock().unwrap().busy
    }

    /// Pops an idle worker, growing the pool if there is headroom; blocks
    /// until one is recycled otherwise. Returns `None` once the pool has
    /// shut down or a thread could not be spawned.
    pub(crate) fn get_worker(&self) -> Option<WorkerHandle> {
        let mut state = self.inner.state.lock().unwrap();

        loop {
            if !state.open {
                return None;
            }

            if let Some(worker) = state.idle.pop() {
                state.busy += 1;
                return Some(worker);
            }

            if self.inner.max_threads < 0 || (state.current as i64) < self.inner.max_threads {
                state.current += 1;
                state.busy += 1;
                let id = state.next_id;
                state.next_id += 1;
                drop(state);

                match self.spawn(id) {
                    Ok(worker) => return Some(worker),
                    Err(e) => {
                        error!("failed to spawn worker thread: {}", e);
                        let mut state = self.inner.state.lock().unwrap();
                        state.current -= 1;
                        state.busy -= 1;
                        return None;
                    }
                }
            }

            state = self.inner.returned.wait(state).unwrap();
        }
    }

    fn spawn(&self, id: usize) -> std::io::Result<WorkerHandle> {
        let mailbox = Arc::new(Mailbox::new());
        let handle = WorkerHandle {
            mailbox: mailbox.clone(),
        };

        let pool = WorkerPool {
            inner: self.inner.clone(),
        };
        let worker = handle.clone();

        thread::Builder::new()
            .name(format!("{}-worker-{}", self.inner.name, id))
            .spawn(move || pool.run_worker(worker, mailbox))?;

        Ok(handle)
    }

    fn run_worker(&self, handle: WorkerHandle, mailbox: Arc<Mailbox>) {
        trace!("worker thread started");

        loop {
            let dispatch = mailbox.take();

            if let Dispatch::Shutdown = dispatch {
                break;
            }

            execute_dispatch(&*self.inner.handler, &self.inner.running, dispatch);

            if !self.recycle(&handle) {
                break;
            }
        }

        trace!("worker thread exiting");
    }

    /// Pushes a worker back onto the idle stack and signals one waiter.
    /// Returns false when the pool has shut down; the worker then exits.
    pub(crate) fn recycle(&self, handle: &WorkerHandle) -> bool {
        let mut state = self.inner.state.lock().unwrap();

        state.busy = state.busy.saturating_sub(1);

        if !state.open {
            return false;
        }

        state.idle.push(handle.clone());
        self.inner.returned.notify_one();
        true
    }

    /// Rejects further acquisitions, releases idle workers and wakes every
    /// blocked requester. Busy workers finish their dispatch and exit when
    /// they fail to recycle.
    pub(crate) fn shutdown(&self) {
        let drained: Vec<WorkerHandle> = {
            let mut state = self.inner.state.lock().unwrap();
            state.open = false;
            self.inner.returned.notify_all();
            state.idle.drain(..).collect()
        };

        for worker in drained {
            worker.assign(Dispatch::Shutdown);
        }
    }
}

impl Clone for WorkerPool {
    fn clone(&self) -> WorkerPool {
        WorkerPool {
            inner: self.inner.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;
    use std::sync::mpsc::channel;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::{Dispatch, Mailbox, WorkerPool};
    use crate::handler::{Handler, SocketState};
    use crate::socket::Socket;

    struct Nop;

    impl Handler for Nop {
        fn process(&self, _socket: &Socket) -> SocketState {
            SocketState::Closed
        }
    }

    fn pool(max_threads: i64) -> WorkerPool {
        WorkerPool::new(
            max_threads,
            "test",
            Arc::new(Nop),
            Arc::new(AtomicBool::new(true)),
        )
    }

    #[test]
    fn mailbox_hands_off_in_order() {
        let mailbox = Arc::new(Mailbox::new());

        let consumer = {
            let mailbox = mailbox.clone();
            thread::spawn(move || {
                let mut shutdowns = 0;
                for _ in 0..3 {
                    if let Dispatch::Shutdown = mailbox.take() {
                        shutdowns += 1;
                    }
                }
                shutdowns
            })
        };

        // each assign rendezvouses with one take
        for _ in 0..3 {
            mailbox.assign(Dispatch::Shutdown);
        }

        assert_eq!(consumer.join().unwrap(), 3);
    }

    #[test]
    fn saturated_pool_blocks_until_recycle() {
        let pool = pool(1);

        let first = pool.get_worker().unwrap();
        assert_eq!(pool.current_thread_count(), 1);
        assert_eq!(pool.current_threads_busy(), 1);

        let (tx, rx) = channel();
        let waiter = {
            let pool = pool.clone();
            thread::spawn(move || {
                tx.send(()).unwrap();
                pool.get_worker().is_some()
            })
        };

        rx.recv().unwrap();
        thread::sleep(Duration::from_millis(100));

        // still saturated; the waiter must not have acquired anything
        assert_eq!(pool.current_thread_count(), 1);

        assert!(pool.recycle(&first));
        assert!(waiter.join().unwrap());
        assert_eq!(pool.current_threads_busy(), 1);

        pool.shutdown();
    }

    #[test]
    fn shutdown_releases_blocked_requesters() {
        let pool = pool(1);

        let _busy = pool.get_worker().unwrap();

        let waiter = {
            let pool = pool.clone();
            thread::spawn(move || pool.get_worker().is_none())
        };

        thread::sleep(Duration::from_millis(50));
        pool.shutdown();

        assert!(waiter.join().unwrap());
    }

    #[test]
    fn counters_respect_bounds() {
        let pool = pool(2);

        let a = pool.get_worker().unwrap();
        let b = pool.get_worker().unwrap();

        assert_eq!(pool.current_thread_count(), 2);
        assert_eq!(pool.current_threads_busy(), 2);

        assert!(pool.recycle(&a));
        assert_eq!(pool.current_threads_busy(), 1);

        // LIFO reuse: the recycled worker comes straight back
        let again = pool.get_worker().unwrap();
        assert_eq!(pool.current_thread_count(), 2);

        assert!(pool.recycle(&again));
        assert!(pool.recycle(&b));
        pool.shutdown();
    }
}
