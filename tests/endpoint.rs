use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tcp_endpoint::{Endpoint, Executor, Handler, Socket, SocketState};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    cond()
}

/// Echoes whatever arrives, optionally holding each dispatch for `delay` to
/// make concurrency observable.
struct Echo {
    delay: Duration,
    calls: AtomicUsize,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl Echo {
    fn new(delay: Duration) -> Echo {
        Echo {
            delay,
            calls: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

impl Handler for Echo {
    fn process(&self, socket: &Socket) -> SocketState {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(active, Ordering::SeqCst);

        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }

        let mut buf = [0u8; 1024];
        let state = loop {
            match socket.read(&mut buf) {
                Ok(0) => break SocketState::Closed,
                Ok(n) => {
                    if socket.write(&buf[..n]).is_err() {
                        break SocketState::Closed;
                    }
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => break SocketState::Open,
                Err(ref e) if e.kind() == ErrorKind::Interrupted => {}
                Err(_) => break SocketState::Closed,
            }
        };

        self.active.fetch_sub(1, Ordering::SeqCst);
        state
    }
}

fn start_endpoint<H: Handler + 'static>(
    handler: Arc<H>,
    configure: impl FnOnce(&mut Endpoint),
) -> (Endpoint, SocketAddr) {
    init_logging();

    let mut endpoint = Endpoint::new();
    endpoint.set_name("test");
    endpoint.set_port(0);
    endpoint.set_address("127.0.0.1".parse().unwrap());
    endpoint.set_handler(handler);
    configure(&mut endpoint);
    endpoint.start().unwrap();

    let addr = endpoint.local_addr().unwrap();
    (endpoint, addr)
}

fn connect(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    stream
}

fn exchange(stream: &mut TcpStream, payload: &[u8]) {
    stream.write_all(payload).unwrap();

    let mut buf = vec![0u8; payload.len()];
    stream.read_exact(&mut buf).unwrap();
    assert_eq!(&buf[..], payload);
}

#[test]
fn concurrent_echo_under_bounded_pool() {
    let handler = Arc::new(Echo::new(Duration::ZERO));
    let (mut endpoint, addr) = start_endpoint(handler.clone(), |e| {
        e.set_max_threads(4);
    });

    let clients: Vec<_> = (0..10)
        .map(|_| {
            thread::spawn(move || {
                let mut stream = connect(addr);
                for _ in 0..100 {
                    exchange(&mut stream, b"ping");
                }
            })
        })
        .collect();

    for client in clients {
        client.join().unwrap();
    }

    assert!(handler.peak() <= 4, "peak concurrency {}", handler.peak());
    assert!(endpoint.current_thread_count() <= 4);

    // all clients have closed; the poller reaps the registrations
    assert!(wait_until(Duration::from_secs(5), || {
        endpoint.keep_alive_count() == 0
    }));

    endpoint.stop();
    endpoint.destroy();
}

#[test]
fn idle_connection_is_cancelled() {
    let handler = Arc::new(Echo::new(Duration::ZERO));
    let (mut endpoint, addr) = start_endpoint(handler, |e| {
        e.set_so_timeout(Some(Duration::from_millis(200)));
    });

    let mut stream = connect(addr);
    exchange(&mut stream, b"hi");

    // silent past the cutoff; the idle scan closes the server side
    thread::sleep(Duration::from_millis(700));

    assert!(wait_until(Duration::from_secs(5), || {
        endpoint.keep_alive_count() == 0
    }));

    let mut buf = [0u8; 16];
    match stream.read(&mut buf) {
        Ok(0) => {}
        Ok(n) => panic!("unexpected {} bytes after idle close", n),
        Err(_) => {}
    }

    endpoint.stop();
    endpoint.destroy();
}

#[test]
fn pause_defers_processing_until_resume() {
    let handler = Arc::new(Echo::new(Duration::ZERO));
    let (mut endpoint, addr) = start_endpoint(handler.clone(), |_| {});

    endpoint.pause();
    assert!(endpoint.is_paused());

    // the kernel backlog may complete the handshake, but nothing is
    // accepted or dispatched while paused
    let mut stream = connect(addr);
    stream.write_all(b"ping").unwrap();

    thread::sleep(Duration::from_millis(400));
    assert_eq!(handler.calls(), 0);

    endpoint.resume();
    assert!(!endpoint.is_paused());

    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"ping");

    endpoint.stop();
    endpoint.destroy();
}

struct ChannelExecutor {
    tx: Mutex<mpsc::Sender<Box<dyn FnOnce() + Send>>>,
    submitted: AtomicUsize,
}

impl ChannelExecutor {
    fn new(size: usize) -> Arc<ChannelExecutor> {
        let (tx, rx) = mpsc::channel::<Box<dyn FnOnce() + Send>>();
        let rx = Arc::new(Mutex::new(rx));

        for _ in 0..size {
            let rx = rx.clone();
            thread::spawn(move || loop {
                let task = rx.lock().unwrap().recv();
                match task {
                    Ok(task) => task(),
                    Err(_) => break,
                }
            });
        }

        Arc::new(ChannelExecutor {
            tx: Mutex::new(tx),
            submitted: AtomicUsize::new(0),
        })
    }
}

impl Executor for ChannelExecutor {
    fn execute(&self, task: Box<dyn FnOnce() + Send>) {
        self.submitted.fetch_add(1, Ordering::SeqCst);
        let _ = self.tx.lock().unwrap().send(task);
    }
}

#[test]
fn external_executor_bypasses_pool() {
    let handler = Arc::new(Echo::new(Duration::ZERO));
    let executor = ChannelExecutor::new(2);
    let (mut endpoint, addr) = start_endpoint(handler, {
        let executor = executor.clone();
        move |e| e.set_executor(Some(executor))
    });

    let clients: Vec<_> = (0..5)
        .map(|_| {
            thread::spawn(move || {
                let mut stream = connect(addr);
                exchange(&mut stream, b"ping");
            })
        })
        .collect();

    for client in clients {
        client.join().unwrap();
    }

    assert!(executor.submitted.load(Ordering::SeqCst) >= 5);
    // the internal pool was never built, let alone used
    assert_eq!(endpoint.current_thread_count(), 0);

    endpoint.stop();
    endpoint.destroy();
}

/// Goes long on the first dispatch; a later re-arm plus client data must
/// produce exactly one event delivery.
struct LongPoll {
    parked: Mutex<Option<Socket>>,
    events: AtomicUsize,
    saw_error: AtomicBool,
}

impl LongPoll {
    fn new() -> LongPoll {
        LongPoll {
            parked: Mutex::new(None),
            events: AtomicUsize::new(0),
            saw_error: AtomicBool::new(false),
        }
    }

    fn parked(&self) -> Option<Socket> {
        self.parked.lock().unwrap().clone()
    }
}

impl Handler for LongPoll {
    fn process(&self, socket: &Socket) -> SocketState {
        let mut buf = [0u8; 64];
        loop {
            match socket.read(&mut buf) {
                Ok(0) => return SocketState::Closed,
                Ok(_) => {}
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(_) => return SocketState::Closed,
            }
        }

        socket.set_comet(true);
        *self.parked.lock().unwrap() = Some(socket.clone());
        SocketState::Long
    }

    fn event(&self, socket: &Socket, error: bool) -> SocketState {
        self.events.fetch_add(1, Ordering::SeqCst);

        if error {
            self.saw_error.store(true, Ordering::SeqCst);
            return SocketState::Closed;
        }

        let mut buf = [0u8; 64];
        loop {
            match socket.read(&mut buf) {
                Ok(0) => return SocketState::Closed,
                Ok(n) => {
                    if socket.write(&buf[..n]).is_err() {
                        return SocketState::Closed;
                    }
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                    return SocketState::Closed;
                }
                Err(_) => return SocketState::Closed,
            }
        }
    }
}

#[test]
fn long_poll_rearm_delivers_one_event() {
    let handler = Arc::new(LongPoll::new());
    let (mut endpoint, addr) = start_endpoint(handler.clone(), |_| {});

    let mut stream = connect(addr);
    stream.write_all(b"x").unwrap();

    // the first dispatch parks the connection
    assert!(wait_until(Duration::from_secs(5), || handler.parked().is_some()));
    assert_eq!(handler.events.load(Ordering::SeqCst), 0);

    let socket = handler.parked().unwrap();
    socket.rearm();

    // armed but silent: nothing may be delivered yet
    thread::sleep(Duration::from_millis(300));
    assert_eq!(handler.events.load(Ordering::SeqCst), 0);

    stream.write_all(b"ping").unwrap();

    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"ping");

    assert!(wait_until(Duration::from_secs(5), || {
        handler.events.load(Ordering::SeqCst) == 1
    }));
    assert!(!handler.saw_error.load(Ordering::SeqCst));

    endpoint.stop();
    endpoint.destroy();
}

#[test]
fn stop_lets_in_flight_dispatches_finish() {
    let handler = Arc::new(Echo::new(Duration::from_millis(300)));
    let (mut endpoint, addr) = start_endpoint(handler.clone(), |_| {});

    let clients: Vec<_> = (0..3)
        .map(|_| {
            thread::spawn(move || {
                let mut stream = connect(addr);
                stream.write_all(b"ping").unwrap();

                let mut buf = [0u8; 4];
                stream.read_exact(&mut buf).unwrap();
                assert_eq!(&buf, b"ping");
            })
        })
        .collect();

    // let all three reach their handler before pulling the plug
    assert!(wait_until(Duration::from_secs(5), || handler.calls() == 3));

    endpoint.stop();
    assert!(!endpoint.is_running());

    for client in clients {
        client.join().unwrap();
    }

    endpoint.destroy();
    assert!(TcpStream::connect(addr).is_err());
}

#[test]
fn lifecycle_is_idempotent() {
    let handler = Arc::new(Echo::new(Duration::ZERO));

    init_logging();
    let mut endpoint = Endpoint::new();
    endpoint.set_name("test");
    endpoint.set_port(0);
    endpoint.set_address("127.0.0.1".parse().unwrap());
    endpoint.set_handler(handler);

    endpoint.init().unwrap();
    endpoint.init().unwrap();

    endpoint.start().unwrap();
    endpoint.start().unwrap();
    let addr = endpoint.local_addr().unwrap();

    let mut stream = connect(addr);
    exchange(&mut stream, b"ping");

    endpoint.pause();
    endpoint.pause();
    endpoint.resume();

    // an established connection keeps being served across pause/resume
    exchange(&mut stream, b"pong");

    endpoint.stop();
    endpoint.stop();
    assert!(!endpoint.is_running());

    endpoint.destroy();
    endpoint.destroy();
}

#[test]
fn single_worker_serializes_dispatches() {
    let handler = Arc::new(Echo::new(Duration::from_millis(150)));
    let (mut endpoint, addr) = start_endpoint(handler.clone(), |e| {
        e.set_max_threads(1);
    });

    let clients: Vec<_> = (0..2)
        .map(|_| {
            thread::spawn(move || {
                let mut stream = connect(addr);
                exchange(&mut stream, b"ping");
            })
        })
        .collect();

    for client in clients {
        client.join().unwrap();
    }

    assert_eq!(handler.peak(), 1, "dispatches overlapped");
    assert_eq!(endpoint.current_thread_count(), 1);

    endpoint.stop();
    endpoint.destroy();
}
