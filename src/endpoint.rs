use std::net::{IpAddr, Ipv4Addr, Shutdown, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use std::{cmp, io};

use log::{debug, error, info, warn};

use crate::acceptor::Acceptor;
use crate::handler::Handler;
use crate::net::{TcpListener, TcpStream};
use crate::poller::Poller;
use crate::sendfile::{Sendfile, SendfileData};
use crate::socket::Socket;
use crate::ssl::{SslConfig, TlsHandshake};
use crate::worker::{Dispatch, WorkerPool};

/// A submit-one-task capability. When configured on the endpoint it replaces
/// the internal worker pool entirely; the handler contract is unchanged.
pub trait Executor: Send + Sync {
    fn execute(&self, task: Box<dyn FnOnce() + Send>);
}

/// Configuration snapshot taken at `start`. Setter changes made while the
/// endpoint runs apply to the next start.
#[derive(Clone)]
pub(crate) struct Config {
    pub(crate) port: u16,
    pub(crate) address: IpAddr,
    pub(crate) backlog: i32,
    pub(crate) tcp_no_delay: bool,
    pub(crate) so_linger: Option<Duration>,
    pub(crate) so_timeout: Option<Duration>,
    pub(crate) first_read_timeout: Duration,
    pub(crate) max_threads: i32,
    pub(crate) thread_priority: i32,
    pub(crate) daemon: bool,
    pub(crate) name: String,
    pub(crate) poller_size: usize,
    pub(crate) poll_time: Duration,
    pub(crate) selector_timeout: Duration,
    pub(crate) poller_thread_count: usize,
    pub(crate) acceptor_thread_count: usize,
    pub(crate) use_sendfile: bool,
    pub(crate) use_comet: bool,
    pub(crate) ssl: SslConfig,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            port: 0,
            address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            backlog: 100,
            tcp_no_delay: false,
            so_linger: Some(Duration::from_secs(100)),
            so_timeout: None,
            first_read_timeout: Duration::from_secs(60),
            max_threads: 40,
            thread_priority: 5,
            daemon: true,
            name: "endpoint".to_string(),
            poller_size: 8192,
            poll_time: Duration::from_micros(2000),
            selector_timeout: Duration::from_millis(5000),
            poller_thread_count: 1,
            acceptor_thread_count: 1,
            use_sendfile: false,
            use_comet: true,
            ssl: SslConfig::default(),
        }
    }
}

/// Routes a dispatch either into the worker pool (blocking until a worker
/// is available; the back-pressure point) or to the external executor.
#[derive(Clone)]
pub(crate) struct Dispatcher {
    pool: Option<WorkerPool>,
    executor: Option<Arc<dyn Executor>>,
    handler: Arc<dyn Handler>,
    running: Arc<AtomicBool>,
}

impl Dispatcher {
    pub(crate) fn process_socket(&self, socket: Socket) -> bool {
        self.submit(Dispatch::Process(socket))
    }

    pub(crate) fn process_socket_event(&self, socket: Socket, error: bool) -> bool {
        self.submit(Dispatch::Event { socket, error })
    }

    fn submit(&self, dispatch: Dispatch) -> bool {
        if let Some(executor) = &self.executor {
            let handler = self.handler.clone();
            let running = self.running.clone();

            executor.execute(Box::new(move || {
                crate::worker::execute_dispatch(&*handler, &running, dispatch);
            }));

            return true;
        }

        if let Some(pool) = &self.pool {
            if let Some(worker) = pool.get_worker() {
                worker.assign(dispatch);
                return true;
            }
        }

        if self.running.load(Ordering::Acquire) {
            error!("no worker available for dispatch; caller must close");
        } else {
            debug!("dispatch refused during shutdown");
        }

        false
    }
}

/// State shared with acceptor threads.
pub(crate) struct Shared {
    pub(crate) config: Config,
    pub(crate) running: Arc<AtomicBool>,
    pub(crate) paused: Arc<AtomicBool>,
    pub(crate) pollers: Vec<Poller>,
    poller_rotater: AtomicUsize,
    tls: Option<Arc<dyn TlsHandshake>>,
}

impl Shared {
    /// Round-robin across the poller array.
    pub(crate) fn get_poller(&self) -> &Poller {
        let idx = self.poller_rotater.fetch_add(1, Ordering::Relaxed) % self.pollers.len();
        &self.pollers[idx]
    }

    /// Prepares a freshly accepted connection and hands it to a poller.
    /// Returns false if any step fails; the socket is closed here.
    pub(crate) fn set_socket_options(&self, stream: TcpStream) -> bool {
        if let Err(e) = self.configure_socket(&stream) {
            debug!("socket setup failed: {}", e);
            let _ = stream.shutdown(Shutdown::Both);
            return false;
        }

        if self.config.ssl.enabled {
            match &self.tls {
                Some(tls) => {
                    if let Err(e) = tls.handshake(&stream) {
                        debug!("TLS handshake failed: {}", e);
                        let _ = stream.shutdown(Shutdown::Both);
                        return false;
                    }
                }
                None => {
                    debug!("TLS enabled without a handshake provider; refusing connection");
                    let _ = stream.shutdown(Shutdown::Both);
                    return false;
                }
            }
        }

        if !self.get_poller().register(Arc::new(stream)) {
            error!("poller rejected connection registration");
            return false;
        }

        true
    }

    fn configure_socket(&self, stream: &TcpStream) -> io::Result<()> {
        stream.set_nodelay(self.config.tcp_no_delay)?;
        stream.set_linger(self.config.so_linger)?;
        stream.set_read_timeout(self.config.so_timeout)?;
        Ok(())
    }
}

/// The connection endpoint facade.
///
/// Owns the listening socket, the poller array and the worker pool, and
/// walks the lifecycle `init` → `start` → (`pause` ↔ `resume`) → `stop` →
/// `destroy`. Transitions are idempotent where that is safe: starting a
/// running endpoint, stopping a stopped one and destroying twice are all
/// no-ops.
pub struct Endpoint {
    config: Config,
    handler: Option<Arc<dyn Handler>>,
    executor: Option<Arc<dyn Executor>>,
    tls: Option<Arc<dyn TlsHandshake>>,
    sendfile: Option<Arc<dyn Sendfile>>,
    sendfile_count: Arc<AtomicUsize>,
    listener: Option<TcpListener>,
    shared: Option<Arc<Shared>>,
    pool: Option<WorkerPool>,
    threads: Vec<JoinHandle<()>>,
    initialized: bool,
    running: Arc<AtomicBool>,
    paused: Arc<AtomicBool>,
}

impl Endpoint {
    pub fn new() -> Endpoint {
        Endpoint {
            config: Config::default(),
            handler: None,
            executor: None,
            tls: None,
            sendfile: None,
            sendfile_count: Arc::new(AtomicUsize::new(0)),
            listener: None,
            shared: None,
            pool: None,
            threads: Vec::new(),
            initialized: false,
            running: Arc::new(AtomicBool::new(false)),
            paused: Arc::new(AtomicBool::new(false)),
        }
    }

    // ===== configuration =====

    pub fn set_port(&mut self, port: u16) {
        self.config.port = port;
    }

    pub fn port(&self) -> u16 {
        self.config.port
    }

    pub fn set_address(&mut self, address: IpAddr) {
        self.config.address = address;
    }

    pub fn address(&self) -> IpAddr {
        self.config.address
    }

    /// The actually bound address; differs from the configured one when
    /// port 0 asked the kernel to pick.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    pub fn set_backlog(&mut self, backlog: i32) {
        if backlog > 0 {
            self.config.backlog = backlog;
        }
    }

    pub fn set_tcp_no_delay(&mut self, no_delay: bool) {
        self.config.tcp_no_delay = no_delay;
    }

    pub fn set_so_linger(&mut self, linger: Option<Duration>) {
        self.config.so_linger = linger;
    }

    /// Idle cutoff for keep-alive connections; `None` disables the scan.
    pub fn set_so_timeout(&mut self, timeout: Option<Duration>) {
        self.config.so_timeout = timeout;
    }

    /// Budget for the first read before a handler parks a connection.
    /// Enforced by handlers, not by the endpoint.
    pub fn set_first_read_timeout(&mut self, timeout: Duration) {
        self.config.first_read_timeout = timeout;
    }

    pub fn first_read_timeout(&self) -> Duration {
        self.config.first_read_timeout
    }

    /// Worker pool bound; negative means unbounded.
    pub fn set_max_threads(&mut self, max_threads: i32) {
        self.config.max_threads = max_threads;
    }

    pub fn max_threads(&self) -> i32 {
        self.config.max_threads
    }

    /// Advisory; recorded but not applied, the platform thread API has no
    /// priority notion.
    pub fn set_thread_priority(&mut self, priority: i32) {
        self.config.thread_priority = priority;
    }

    pub fn thread_priority(&self) -> i32 {
        self.config.thread_priority
    }

    /// Advisory; worker threads are always detached, acceptor and poller
    /// threads are joined on stop.
    pub fn set_daemon(&mut self, daemon: bool) {
        self.config.daemon = daemon;
    }

    pub fn daemon(&self) -> bool {
        self.config.daemon
    }

    /// Thread name prefix.
    pub fn set_name(&mut self, name: &str) {
        self.config.name = name.to_string();
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Registration capacity per poller.
    pub fn set_poller_size(&mut self, size: usize) {
        if size > 0 {
            self.config.poller_size = size;
        }
    }

    /// Grace period a poller grants in-flight selection before closing.
    pub fn set_poll_time(&mut self, poll_time: Duration) {
        self.config.poll_time = poll_time;
    }

    /// Upper bound on one selector wait.
    pub fn set_selector_timeout(&mut self, timeout: Duration) {
        self.config.selector_timeout = timeout;
    }

    pub fn set_poller_thread_count(&mut self, count: usize) {
        self.config.poller_thread_count = cmp::max(1, count);
    }

    pub fn set_acceptor_thread_count(&mut self, count: usize) {
        self.config.acceptor_thread_count = cmp::max(1, count);
    }

    pub fn set_use_sendfile(&mut self, use_sendfile: bool) {
        self.config.use_sendfile = use_sendfile;
    }

    pub fn set_use_comet(&mut self, use_comet: bool) {
        self.config.use_comet = use_comet;
    }

    pub fn use_comet(&self) -> bool {
        self.config.use_comet
    }

    pub fn set_ssl(&mut self, ssl: SslConfig) {
        self.config.ssl = ssl;
    }

    pub fn ssl(&self) -> &SslConfig {
        &self.config.ssl
    }

    /// The processing boundary. Required before `start`.
    pub fn set_handler(&mut self, handler: Arc<dyn Handler>) {
        self.handler = Some(handler);
    }

    /// Replaces the internal worker pool with an external executor.
    pub fn set_executor(&mut self, executor: Option<Arc<dyn Executor>>) {
        self.executor = executor;
    }

    pub fn set_tls_handshake(&mut self, tls: Option<Arc<dyn TlsHandshake>>) {
        self.tls = tls;
    }

    pub fn set_sendfile(&mut self, sendfile: Option<Arc<dyn Sendfile>>) {
        self.sendfile = sendfile;
    }

    // ===== observability =====

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn keep_alive_count(&self) -> usize {
        self.shared
            .as_ref()
            .map(|s| s.pollers.iter().map(Poller::keep_alive_count).sum())
            .unwrap_or(0)
    }

    pub fn sendfile_count(&self) -> usize {
        self.sendfile_count.load(Ordering::Relaxed)
    }

    pub fn current_thread_count(&self) -> usize {
        self.pool
            .as_ref()
            .map(WorkerPool::current_thread_count)
            .unwrap_or(0)
    }

    pub fn current_threads_busy(&self) -> usize {
        self.pool
            .as_ref()
            .map(WorkerPool::current_threads_busy)
            .unwrap_or(0)
    }

    // ===== lifecycle =====

    /// Binds the listening socket. Idempotent while initialized; a bind
    /// failure is fatal and leaves the endpoint uninitialized.
    pub fn init(&mut self) -> io::Result<()> {
        if self.initialized {
            return Ok(());
        }

        let addr = SocketAddr::new(self.config.address, self.config.port);
        let listener = TcpListener::bind(addr, self.config.backlog)?;

        info!("{} listening on {}", self.config.name, listener.local_addr()?);

        self.listener = Some(listener);
        self.initialized = true;

        Ok(())
    }

    /// Spawns pollers and acceptors. Idempotent while running.
    pub fn start(&mut self) -> io::Result<()> {
        if self.running.load(Ordering::Acquire) {
            return Ok(());
        }

        self.init()?;

        let handler = match &self.handler {
            Some(handler) => handler.clone(),
            None => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "no handler configured",
                ))
            }
        };

        if self.config.use_sendfile {
            if let Some(sendfile) = &self.sendfile {
                sendfile.init()?;
            }
        }

        let pool = if self.executor.is_none() {
            Some(WorkerPool::new(
                self.config.max_threads as i64,
                &self.config.name,
                handler.clone(),
                self.running.clone(),
            ))
        } else {
            None
        };

        let dispatcher = Dispatcher {
            pool: pool.clone(),
            executor: self.executor.clone(),
            handler,
            running: self.running.clone(),
        };

        let mut pollers = Vec::with_capacity(self.config.poller_thread_count);
        for _ in 0..self.config.poller_thread_count {
            pollers.push(Poller::new(&self.config)?);
        }

        self.running.store(true, Ordering::Release);
        self.paused.store(false, Ordering::Release);

        let shared = Arc::new(Shared {
            config: self.config.clone(),
            running: self.running.clone(),
            paused: self.paused.clone(),
            pollers,
            poller_rotater: AtomicUsize::new(0),
            tls: self.tls.clone(),
        });

        match self.spawn_threads(&shared, &dispatcher) {
            Ok(threads) => {
                self.threads = threads;
            }
            Err(e) => {
                self.running.store(false, Ordering::Release);
                for poller in &shared.pollers {
                    poller.destroy();
                }
                if let Some(pool) = &pool {
                    pool.shutdown();
                }
                return Err(e);
            }
        }

        self.shared = Some(shared);
        self.pool = pool;

        info!("{} started", self.config.name);

        Ok(())
    }

    fn spawn_threads(
        &self,
        shared: &Arc<Shared>,
        dispatcher: &Dispatcher,
    ) -> io::Result<Vec<JoinHandle<()>>> {
        let mut threads = Vec::new();

        for (i, poller) in shared.pollers.iter().enumerate() {
            let poller = poller.clone();
            let dispatcher = dispatcher.clone();

            threads.push(
                thread::Builder::new()
                    .name(format!("{}-poller-{}", self.config.name, i))
                    .spawn(move || poller.run(dispatcher))?,
            );
        }

        let listener = match &self.listener {
            Some(listener) => listener,
            None => return Err(io::Error::new(io::ErrorKind::Other, "listener not bound")),
        };

        for i in 0..self.config.acceptor_thread_count {
            let listener = listener.try_clone()?;
            let shared = shared.clone();

            threads.push(
                thread::Builder::new()
                    .name(format!("{}-acceptor-{}", self.config.name, i))
                    .spawn(move || Acceptor::new(listener, shared).run())?,
            );
        }

        Ok(threads)
    }

    /// Stops accepting. Connections already in the kernel backlog stay
    /// there and are processed after `resume`.
    pub fn pause(&self) {
        if self.running.load(Ordering::Acquire) && !self.paused.swap(true, Ordering::AcqRel) {
            info!("{} paused", self.config.name);
        }
    }

    pub fn resume(&self) {
        if self.paused.swap(false, Ordering::AcqRel) {
            info!("{} resumed", self.config.name);
        }
    }

    /// Quiesces the endpoint: no new dispatch begins, in-flight handler
    /// calls run to completion, pollers tear their registrations down, and
    /// acceptor/poller threads are joined. Idempotent.
    pub fn stop(&mut self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.paused.store(false, Ordering::Release);

        if let Some(shared) = &self.shared {
            for poller in &shared.pollers {
                poller.destroy();
            }
        }

        if let Some(pool) = &self.pool {
            pool.shutdown();
        }

        for thread in self.threads.drain(..) {
            if thread.join().is_err() {
                warn!("endpoint thread panicked during shutdown");
            }
        }

        self.shared = None;
        self.pool = None;

        if self.config.use_sendfile {
            if let Some(sendfile) = &self.sendfile {
                sendfile.destroy();
            }
        }

        info!("{} stopped", self.config.name);
    }

    /// Ensures `stop`, closes the listening socket and returns the endpoint
    /// to its unconfigured-socket state. Safe to call repeatedly.
    pub fn destroy(&mut self) {
        self.stop();
        self.listener = None;
        self.initialized = false;
    }

    /// Hands a file transmission to the configured provider. False when
    /// sendfile is disabled, unconfigured, or the provider refuses.
    pub fn add_sendfile(&self, data: SendfileData) -> bool {
        if !self.config.use_sendfile {
            return false;
        }

        match &self.sendfile {
            Some(sendfile) if sendfile.add(data) => {
                self.sendfile_count.fetch_add(1, Ordering::Relaxed);
                true
            }
            _ => false,
        }
    }
}

impl Default for Endpoint {
    fn default() -> Endpoint {
        Endpoint::new()
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.stop();
    }
}
