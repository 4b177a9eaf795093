use std::any::Any;
use std::io::{ErrorKind, Read, Write};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use log::{debug, error, info, warn};

use super::connector::{Closer, Connector};
use crate::cancel::CancelToken;
use crate::error::Result;
use crate::protocol::Destination;
use crate::transport::{Packet, Transport};

/// Largest chunk read from the upstream per binary message.
pub const BUFFER_SIZE: usize = 1024;

/// Runs a release action at most once, on the first `close()` or on drop.
pub struct CloseGuard {
    closer: Mutex<Option<Closer>>,
}

impl CloseGuard {
    pub fn new<F>(closer: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        CloseGuard {
            closer: Mutex::new(Some(Box::new(closer))),
        }
    }

    fn from_option(closer: Option<Closer>) -> Self {
        CloseGuard {
            closer: Mutex::new(closer),
        }
    }

    /// Returns `true` only for the call that ran the action.
    pub fn close(&self) -> bool {
        let closer = self.closer.lock().unwrap_or_else(PoisonError::into_inner).take();
        match closer {
            Some(closer) => {
                closer();
                true
            }
            None => false,
        }
    }
}

impl Drop for CloseGuard {
    fn drop(&mut self) {
        self.close();
    }
}

/// Cancels the session when a direction exits, unwinding included.
struct StopOnExit<'a>(&'a CancelToken);

impl Drop for StopOnExit<'_> {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg
    } else {
        "unknown panic"
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Bytes written to the upstream.
    pub to_upstream: u64,
    /// Bytes sent over the channel.
    pub to_channel: u64,
}

/// One accepted channel bridged to one upstream, two directions sharing one
/// cancellation token. Whichever direction stops first cancels the other.
pub struct RelaySession {
    sid: String,
    destination: Destination,
    channel: Arc<dyn Transport>,
    token: CancelToken,
    forward_text: bool,
}

impl RelaySession {
    pub fn new(sid: &str, destination: Destination, channel: Arc<dyn Transport>) -> Self {
        RelaySession {
            sid: sid.to_owned(),
            destination,
            channel,
            token: CancelToken::new(),
            forward_text: false,
        }
    }

    pub fn with_token(mut self, token: CancelToken) -> Self {
        self.token = token;
        self
    }

    /// Text messages are written upstream too instead of being dropped.
    pub fn with_forward_text(mut self, forward_text: bool) -> Self {
        self.forward_text = forward_text;
        self
    }

    pub fn token(&self) -> &CancelToken {
        &self.token
    }

    /// Obtains the upstream and relays until either side ends. The channel
    /// and the upstream are each closed exactly once on every path.
    pub fn run(self, connector: &dyn Connector) -> Result<RelayStats> {
        let channel_guard = Arc::new({
            let channel = self.channel.clone();
            let sid = self.sid.clone();
            CloseGuard::new(move || {
                if let Err(e) = channel.close() {
                    debug!("[{}] close channel: {}", sid, e);
                }
            })
        });

        info!("[{}] REQ CONNECT => {}", self.sid, self.destination);
        let upstream = match connector.connect(&self.destination) {
            Ok(upstream) => upstream,
            Err(e) => {
                error!("[{}] DIAL FAILED => {}: {}", self.sid, self.destination, e);
                channel_guard.close();
                return Err(e);
            }
        };
        info!("[{}] DIAL SUCCESS => {}", self.sid, self.destination);

        let (reader, writer, closer) = upstream.split();
        let upstream_guard = Arc::new(CloseGuard::from_option(closer));
        {
            let channel_guard = channel_guard.clone();
            let upstream_guard = upstream_guard.clone();
            // neither close waits on the other side's I/O
            self.token.on_cancel(move || {
                upstream_guard.close();
                channel_guard.close();
            });
        }

        let stats = thread::scope(|s| {
            let upward = s.spawn(|| self.channel_to_upstream(writer));
            let to_channel = self.upstream_to_channel(reader);
            let to_upstream = match upward.join() {
                Ok(total) => total,
                Err(panic) => {
                    error!("[{}] channel to upstream direction panicked: {}", self.sid, panic_message(&*panic));
                    0
                }
            };
            RelayStats { to_upstream, to_channel }
        });

        self.token.cancel();
        channel_guard.close();
        upstream_guard.close();
        info!(
            "[{}] session {} done, up {} bytes, down {} bytes",
            self.sid, self.destination, stats.to_upstream, stats.to_channel
        );
        Ok(stats)
    }

    fn channel_to_upstream(&self, mut writer: Box<dyn Write + Send>) -> u64 {
        let _stop = StopOnExit(&self.token);
        let mut total = 0u64;
        while !self.token.is_cancelled() {
            let data = match self.channel.read_packet() {
                Ok(Packet::Binary(data)) => data,
                Ok(Packet::Text(text)) if self.forward_text => text.into_bytes(),
                Ok(Packet::Text(text)) => {
                    warn!("[{}] text message of {} bytes ignored", self.sid, text.len());
                    continue;
                }
                Err(e) => {
                    if !self.token.is_cancelled() {
                        info!("[{}] channel read end: {}", self.sid, e);
                    }
                    break;
                }
            };
            if let Err(e) = writer.write_all(&data).and_then(|_| writer.flush()) {
                if !self.token.is_cancelled() {
                    error!("[{}] upstream write error: {}", self.sid, e);
                }
                break;
            }
            total += data.len() as u64;
        }
        total
    }

    fn upstream_to_channel(&self, mut reader: Box<dyn Read + Send>) -> u64 {
        let _stop = StopOnExit(&self.token);
        let mut total = 0u64;
        let mut buf = vec![0u8; BUFFER_SIZE];
        while !self.token.is_cancelled() {
            let n = match reader.read(&mut buf) {
                Ok(0) => {
                    info!("[{}] upstream closed", self.sid);
                    break;
                }
                Ok(n) => n,
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted) => {
                    continue
                }
                Err(e) => {
                    if !self.token.is_cancelled() {
                        error!("[{}] upstream read error: {}", self.sid, e);
                    }
                    break;
                }
            };
            if let Err(e) = self.channel.send_packet(&buf[..n]) {
                if !self.token.is_cancelled() {
                    error!("[{}] channel send error: {}", self.sid, e);
                }
                break;
            }
            total += n as u64;
        }
        total
    }
}
