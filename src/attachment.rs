use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, OnceLock};
use std::time::{Duration, Instant};

fn now_millis() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_millis() as u64
}

/// Per-connection state kept alongside a poller registration.
///
/// The poller stamps `access` on every delivery and re-arm; the idle scan
/// compares the stamp against the configured socket timeout. The wake-up
/// flag and the signal pair implement long-poll parking: a thread that wants
/// to wait for the next readiness sets `wake_up`, re-arms read interest and
/// parks; the poller, seeing readiness with `wake_up` set, consumes the flag
/// and signals instead of dispatching.
pub struct KeyAttachment {
    last_access: AtomicU64,
    comet: AtomicBool,
    wake_up: AtomicBool,
    current_access: AtomicBool,
    signal: Mutex<bool>,
    cond: Condvar,
}

impl KeyAttachment {
    pub fn new() -> KeyAttachment {
        KeyAttachment {
            last_access: AtomicU64::new(now_millis()),
            comet: AtomicBool::new(false),
            wake_up: AtomicBool::new(false),
            current_access: AtomicBool::new(false),
            signal: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    /// Stamps the last-access time with now.
    pub fn access(&self) {
        self.last_access.store(now_millis(), Ordering::Relaxed);
    }

    /// Milliseconds on the attachment clock at the last access.
    pub fn last_access(&self) -> u64 {
        self.last_access.load(Ordering::Relaxed)
    }

    /// How long the connection has sat since its last access.
    pub fn idle_for(&self) -> Duration {
        let last = self.last_access();
        Duration::from_millis(now_millis().saturating_sub(last))
    }

    pub fn is_comet(&self) -> bool {
        self.comet.load(Ordering::Acquire)
    }

    pub fn set_comet(&self, comet: bool) {
        self.comet.store(comet, Ordering::Release);
    }

    pub fn wake_up(&self) -> bool {
        self.wake_up.load(Ordering::Acquire)
    }

    pub fn set_wake_up(&self, wake_up: bool) {
        self.wake_up.store(wake_up, Ordering::Release);
    }

    /// Consumes the wake-up flag; true if it was set.
    pub fn take_wake_up(&self) -> bool {
        self.wake_up.swap(false, Ordering::AcqRel)
    }

    pub fn is_current_access(&self) -> bool {
        self.current_access.load(Ordering::Acquire)
    }

    pub fn set_current_access(&self, current: bool) {
        self.current_access.store(current, Ordering::Release);
    }

    /// Blocks until `unpark`, consuming the signal. The signal is sticky: an
    /// unpark that happens before the park is not lost. Returns false if
    /// `timeout` elapses first.
    pub fn park(&self, timeout: Option<Duration>) -> bool {
        let start = Instant::now();
        let mut signalled = self.signal.lock().unwrap();

        while !*signalled {
            match timeout {
                None => signalled = self.cond.wait(signalled).unwrap(),
                Some(to) => {
                    let elapsed = start.elapsed();
                    if elapsed >= to {
                        break;
                    }
                    let (guard, _) = self.cond.wait_timeout(signalled, to - elapsed).unwrap();
                    signalled = guard;
                }
            }
        }

        let was = *signalled;
        *signalled = false;
        was
    }

    /// Releases a parked thread (or arms the signal for the next park).
    pub fn unpark(&self) {
        let mut signalled = self.signal.lock().unwrap();
        *signalled = true;
        self.cond.notify_all();
    }
}

impl Default for KeyAttachment {
    fn default() -> KeyAttachment {
        KeyAttachment::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::KeyAttachment;

    #[test]
    fn park_times_out() {
        let attachment = KeyAttachment::new();
        assert!(!attachment.park(Some(Duration::from_millis(50))));
    }

    #[test]
    fn unpark_before_park_is_not_lost() {
        let attachment = KeyAttachment::new();
        attachment.unpark();
        assert!(attachment.park(Some(Duration::from_millis(50))));
        // consumed; the next park must wait
        assert!(!attachment.park(Some(Duration::from_millis(50))));
    }

    #[test]
    fn unpark_crosses_threads() {
        let attachment = Arc::new(KeyAttachment::new());

        let parker = {
            let attachment = attachment.clone();
            thread::spawn(move || attachment.park(Some(Duration::from_secs(5))))
        };

        thread::sleep(Duration::from_millis(50));
        attachment.unpark();

        assert!(parker.join().unwrap());
    }

    #[test]
    fn access_stamps_move_forward() {
        let attachment = KeyAttachment::new();
        let first = attachment.last_access();

        thread::sleep(Duration::from_millis(20));
        attachment.access();

        assert!(attachment.last_access() >= first);
        assert!(attachment.idle_for() < Duration::from_secs(1));
    }

    #[test]
    fn wake_up_flag_is_consumed_once() {
        let attachment = KeyAttachment::new();

        attachment.set_wake_up(true);
        assert!(attachment.take_wake_up());
        assert!(!attachment.take_wake_up());
    }
}
