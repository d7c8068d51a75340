use std::io;
use std::path::PathBuf;

use crate::net::TcpStream;

/// Client certificate verification policy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum VerifyMode {
    #[default]
    None,
    Optional,
    Require,
}

/// TLS configuration carried by the endpoint.
///
/// The endpoint stores and exposes these knobs but performs no record
/// processing itself; when `enabled`, each accepted socket is offered to the
/// configured [`TlsHandshake`] before registration.
#[derive(Clone, Debug, Default)]
pub struct SslConfig {
    pub enabled: bool,
    pub engine: Option<String>,
    pub protocol: Option<String>,
    pub cipher_suite: Option<String>,
    pub certificate_file: Option<PathBuf>,
    pub certificate_key_file: Option<PathBuf>,
    pub certificate_chain_file: Option<PathBuf>,
    pub ca_certificate_path: Option<PathBuf>,
    pub ca_certificate_file: Option<PathBuf>,
    pub ca_revocation_path: Option<PathBuf>,
    pub ca_revocation_file: Option<PathBuf>,
    pub verify_client: VerifyMode,
    pub verify_depth: u32,
}

/// Performs the server-side handshake on a freshly accepted socket.
///
/// An error refuses the connection: it is logged at debug level and the
/// socket is closed, the same as any other per-connection setup failure.
pub trait TlsHandshake: Send + Sync {
    fn handshake(&self, stream: &TcpStream) -> io::Result<()>;
}
