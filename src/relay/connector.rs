use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use log::debug;

use crate::error::{Result, TunnelError};
use crate::protocol::Destination;

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub type Closer = Box<dyn FnOnce() + Send>;

/// The real endpoint of a relay session, split so each direction owns its half.
pub struct Upstream {
    pub reader: Box<dyn Read + Send>,
    pub writer: Box<dyn Write + Send>,
    closer: Option<Closer>,
}

impl Upstream {
    pub fn new<R, W, C>(reader: R, writer: W, closer: C) -> Self
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
        C: FnOnce() + Send + 'static,
    {
        Upstream {
            reader: Box::new(reader),
            writer: Box::new(writer),
            closer: Some(Box::new(closer)),
        }
    }

    pub fn from_tcp(stream: TcpStream) -> Result<Self> {
        let reader = stream.try_clone()?;
        let writer = stream.try_clone()?;
        Ok(Upstream::new(reader, writer, move || {
            let _ = stream.shutdown(Shutdown::Both);
        }))
    }

    /// Splits into reader, writer and the one-shot closer.
    pub fn split(self) -> (Box<dyn Read + Send>, Box<dyn Write + Send>, Option<Closer>) {
        (self.reader, self.writer, self.closer)
    }
}

/// How a relay session obtains its real endpoint.
pub trait Connector: Send + Sync {
    fn connect(&self, destination: &Destination) -> Result<Upstream>;
}

/// Dials plain TCP destinations.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    timeout: Duration,
}

impl TcpConnector {
    pub fn new(timeout: Duration) -> Self {
        TcpConnector { timeout }
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new(CONNECT_TIMEOUT)
    }
}

impl Connector for TcpConnector {
    fn connect(&self, destination: &Destination) -> Result<Upstream> {
        let stream = dial_tcp(&destination.network, &destination.address, self.timeout)?;
        Upstream::from_tcp(stream)
    }
}

/// Resolves `address` and connects to the first candidate of the requested
/// family that answers within `timeout`.
pub fn dial_tcp(network: &str, address: &str, timeout: Duration) -> Result<TcpStream> {
    let family: fn(&SocketAddr) -> bool = match network {
        "tcp" => |_| true,
        "tcp4" => SocketAddr::is_ipv4,
        "tcp6" => SocketAddr::is_ipv6,
        other => return Err(TunnelError::dial_failed(address, format!("unsupported network '{}'", other))),
    };
    let candidates = address.to_socket_addrs().map_err(|e| TunnelError::dial_failed(address, e))?;

    let mut last_err = format!("no {} address found", network);
    for addr in candidates.filter(family) {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => {
                debug!("dial {} => {}", address, addr);
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Err(e) => last_err = e.to_string(),
        }
    }
    Err(TunnelError::dial_failed(address, last_err))
}
