//! TCP primitives for the endpoint: a listener bound with an explicit
//! backlog and a non-blocking connection stream.

pub mod tcp;

pub use tcp::{TcpListener, TcpStream};
