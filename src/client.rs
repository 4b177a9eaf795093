use std::io::{Read, Write};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use retry::delay::Exponential;
use retry::OperationResult;

use crate::conn::{Dialer, VirtualConn};
use crate::error::{Result, TunnelError};
use crate::option::ClientOption;
use crate::secure::TlsClient;

/// Upper bound on a probe response.
const MAX_RESPONSE: usize = 1 << 20;

/// Reaches a destination through the relay, optionally over mutual TLS, and
/// issues a single HTTP GET.
pub struct ProbeClient {
    opts: ClientOption,
}

impl ProbeClient {
    pub fn new(opts: ClientOption) -> Self {
        ProbeClient { opts }
    }

    /// Dials with exponential back-off. Only failures that might clear up on
    /// their own are retried.
    pub fn dial(&self) -> Result<VirtualConn> {
        let dialer = Dialer::new(&self.opts.relay_url).with_dial_timeout(Duration::from_secs(self.opts.dial_timeout_secs));
        let mut attempt = 0;
        let ret = retry::retry(Exponential::from_millis(100).take(self.opts.dial_retries), || {
            attempt += 1;
            match dialer.dial(&self.opts.network, &self.opts.address) {
                Ok(conn) => OperationResult::Ok(conn),
                Err(e @ (TunnelError::UpgradeFailed(_) | TunnelError::Transport(_))) => {
                    warn!("dial attempt {} failed: {}", attempt, e);
                    OperationResult::Retry(e)
                }
                Err(e) => OperationResult::Err(e),
            }
        });
        ret.map_err(|e| e.error)
    }

    pub fn bootstrap(&self) -> Result<()> {
        let conn = self.dial()?;
        conn.set_read_deadline(Some(Instant::now() + Duration::from_secs(self.opts.read_timeout_secs)));

        let response = match &self.opts.tls {
            Some(tls) => {
                let material = tls.load()?;
                let server_name = tls.server_name.as_deref().unwrap_or(self.opts.host());
                let client = TlsClient::new(&material, server_name)?;
                let stream = client.connect(&conn)?;
                http_get(stream, self.opts.host(), &self.opts.request_path)?
            }
            None => http_get(&conn, self.opts.host(), &self.opts.request_path)?,
        };
        info!("response from {}:\n{}", self.opts.address, response);
        conn.close()
    }
}

/// Sends `GET path` over `stream` and reads the reply until the peer closes.
pub fn http_get<S: Read + Write>(mut stream: S, host: &str, path: &str) -> Result<String> {
    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nUser-Agent: wsrelay\r\nConnection: close\r\n\r\n",
        path, host
    );
    stream.write_all(request.as_bytes())?;
    stream.flush()?;

    let mut body = Vec::new();
    let mut buf = [0u8; 4096];
    while body.len() < MAX_RESPONSE {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => body.extend_from_slice(&buf[..n]),
            Err(e) if !body.is_empty() => {
                debug!("response read stopped: {}", e);
                break;
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(String::from_utf8_lossy(&body).into_owned())
}
