use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};

use crate::error::Result;
use crate::option::HelloOption;
use crate::secure::TlsServer;

const HELLO_REPLY: &[u8] =
    b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 11\r\nConnection: close\r\n\r\nHello World";

/// Request heads larger than this are cut off.
const MAX_HEAD: usize = 8192;

/// A destination for tunnel tests: answers every HTTPS request with
/// `Hello World`, but only to clients with a verified certificate.
pub struct HelloServer {
    listener: TcpListener,
    tls: Arc<TlsServer>,
}

impl HelloServer {
    pub fn bind(addr: &str, tls: TlsServer) -> Result<Self> {
        Ok(HelloServer {
            listener: TcpListener::bind(addr)?,
            tls: Arc::new(tls),
        })
    }

    pub fn from_opts(opts: &HelloOption) -> Result<Self> {
        let tls = TlsServer::new(&opts.tls.load()?)?;
        HelloServer::bind(&format!("{}:{}", opts.listen_addr, opts.listen_port), tls)
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn serve(&self) -> Result<()> {
        info!("hello server on https://{}", self.local_addr()?);
        for conn in self.listener.incoming() {
            match conn {
                Ok(stream) => {
                    let tls = self.tls.clone();
                    thread::spawn(move || handle_hello(&tls, stream));
                }
                Err(e) => warn!("accept error: {}", e),
            }
        }
        Ok(())
    }
}

fn handle_hello(tls: &TlsServer, stream: TcpStream) {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(10)));
    let peer = stream.peer_addr().map(|a| a.to_string()).unwrap_or_default();
    let mut tls_stream = match tls.accept(stream) {
        Ok(s) => s,
        Err(e) => {
            warn!("{}: {}", peer, e);
            return;
        }
    };
    match answer_hello(&mut tls_stream) {
        Ok(()) => debug!("{}: answered", peer),
        Err(e) => warn!("{}: {}", peer, e),
    }
    let _ = tls_stream.shutdown();
}

/// Reads one request head and writes the `Hello World` reply.
pub fn answer_hello<S: Read + Write>(stream: &mut S) -> Result<()> {
    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") && head.len() < MAX_HEAD {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break;
        }
        head.extend_from_slice(&buf[..n]);
    }
    if let Some(line) = head.split(|b| *b == b'\n').next() {
        info!("hello: {}", String::from_utf8_lossy(line).trim_end());
    }
    stream.write_all(HELLO_REPLY)?;
    stream.flush()?;
    Ok(())
}
