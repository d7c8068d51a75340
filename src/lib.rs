//! A non-blocking TCP connection endpoint.
//!
//! `tcp-endpoint` turns one listening socket into a stream of
//! socket-processing events delivered to a pluggable [`Handler`]. It provides
//! the machinery between the kernel and a request processor: acceptor threads,
//! epoll-driven poller threads with per-connection idle timeouts and
//! keep-alive tracking, a bounded worker pool with back-pressure (or an
//! externally supplied [`Executor`]), and long-poll parking for handlers that
//! want to hold a connection open while waiting for future readiness.
//!
//! # Example
//!
//! ```no_run
//! use std::io::ErrorKind;
//! use std::sync::Arc;
//!
//! use tcp_endpoint::{Endpoint, Handler, Socket, SocketState};
//!
//! struct Echo;
//!
//! impl Handler for Echo {
//!     fn process(&self, socket: &Socket) -> SocketState {
//!         let mut buf = [0; 1024];
//!         loop {
//!             match socket.read(&mut buf) {
//!                 Ok(0) => return SocketState::Closed,
//!                 Ok(n) => {
//!                     if socket.write(&buf[..n]).is_err() {
//!                         return SocketState::Closed;
//!                     }
//!                 }
//!                 Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
//!                     // drained; hand the socket back and wait for more data
//!                     return SocketState::Open;
//!                 }
//!                 Err(_) => return SocketState::Closed,
//!             }
//!         }
//!     }
//! }
//!
//! let mut endpoint = Endpoint::new();
//! endpoint.set_port(8080);
//! endpoint.set_handler(Arc::new(Echo));
//! endpoint.start().unwrap();
//!
//! // ... serve ...
//!
//! endpoint.stop();
//! endpoint.destroy();
//! ```

macro_rules! syscall {
    ($fn:ident ( $($arg:expr),* $(,)? )) => {{
        let res = unsafe { libc::$fn($($arg),*) };
        if res < 0 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(res)
        }
    }};
}

mod acceptor;
mod attachment;
mod endpoint;
mod handler;
mod poller;
mod queue;
mod ready;
mod sendfile;
mod socket;
mod ssl;
mod sys;
mod token;
mod waker;
mod worker;

pub mod net;

pub use attachment::KeyAttachment;
pub use endpoint::{Endpoint, Executor};
pub use handler::{Handler, SocketState};
pub use poller::Poller;
pub use ready::Ready;
pub use sendfile::{Sendfile, SendfileData};
pub use socket::Socket;
pub use ssl::{SslConfig, TlsHandshake, VerifyMode};
pub use token::Token;
pub use worker::WorkerPool;
