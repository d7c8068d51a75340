use std::io;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed};
use std::sync::Arc;

pub use concurrent_queue::{ConcurrentQueue, PopError, PushError};

use crate::ready::Ready;
use crate::sys::Selector;
use crate::token::Token;
use crate::waker::Waker;

/// A FIFO whose consumer is a selector loop.
///
/// Producers push from any thread; the queue keeps its waker readable
/// exactly while items are pending, so the owning selector returns from its
/// wait whenever there is something to drain and goes back to sleep once the
/// queue is empty.
pub struct EventQueue<T> {
    inner: Arc<Inner<T>>,
}

struct Inner<T> {
    queue: ConcurrentQueue<T>,
    pending: AtomicUsize,
    waker: Waker,
}

impl<T: Send> EventQueue<T> {
    pub fn unbounded() -> io::Result<EventQueue<T>> {
        Ok(EventQueue {
            inner: Arc::new(Inner {
                queue: ConcurrentQueue::unbounded(),
                pending: AtomicUsize::new(0),
                waker: Waker::new()?,
            }),
        })
    }

    fn inc(&self) -> io::Result<()> {
        let cnt = self.inner.pending.fetch_add(1, Acquire);

        if 0 == cnt {
            self.inner.waker.wake()?;
        }
        Ok(())
    }

    fn dec(&self) -> io::Result<()> {
        let first = self.inner.pending.load(Acquire);

        if first == 1 {
            self.inner.waker.drain()?;
        }

        let second = self.inner.pending.fetch_sub(1, AcqRel);

        if first == 1 && second > 1 {
            self.inner.waker.wake()?;
        }

        Ok(())
    }

    pub fn push(&self, value: T) -> Result<(), PushError<T>> {
        self.inner.queue.push(value).map(|_| {
            let _ = self.inc();
        })
    }

    pub fn pop(&self) -> Result<T, PopError> {
        self.inner.queue.pop().inspect(|_res| {
            let _ = self.dec();
        })
    }

    pub fn close(&self) -> bool {
        self.inner.queue.close()
    }

    /// Adds the queue's waker to `selector`; pending pushes surface as
    /// readable readiness on `token`.
    pub fn register(&self, selector: &Selector, token: Token) -> io::Result<()> {
        selector.add(self.inner.waker.as_raw_fd(), token, Ready::readable(), false)?;

        if self.inner.pending.load(Relaxed) > 0 {
            self.inner.waker.wake()?;
        }

        Ok(())
    }

    /// Forces the owning selector awake even with nothing queued. Used for
    /// shutdown; the readiness is not paired with a drain.
    pub fn wake(&self) -> io::Result<()> {
        self.inner.waker.wake()
    }
}

impl<T: Send> Clone for EventQueue<T> {
    fn clone(&self) -> EventQueue<T> {
        EventQueue {
            inner: self.inner.clone(),
        }
    }
}
