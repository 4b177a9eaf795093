use std::time::{Duration, Instant};

use log::{debug, info};

use super::virtual_conn::{VirtualConn, QUEUE_CAPACITY};
use crate::cancel::CancelToken;
use crate::error::{Result, TunnelError};
use crate::protocol::Destination;
use crate::transport::{FrameChannel, POLL_INTERVAL};

pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Opens virtual connections through a relay endpoint such as
/// `ws://127.0.0.1:40000/tunnel`.
#[derive(Debug, Clone)]
pub struct Dialer {
    endpoint: String,
    dial_timeout: Duration,
    queue_capacity: usize,
    poll_interval: Duration,
    cancel: CancelToken,
}

impl Dialer {
    pub fn new(endpoint: &str) -> Self {
        Dialer {
            endpoint: endpoint.to_owned(),
            dial_timeout: DIAL_TIMEOUT,
            queue_capacity: QUEUE_CAPACITY,
            poll_interval: POLL_INTERVAL,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Connections dialed afterwards are cancelled together with `cancel`.
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Dials `network`/`address` on the far side of the relay and waits for
    /// the channel to open.
    pub fn dial(&self, network: &str, address: &str) -> Result<VirtualConn> {
        let destination = Destination::new(network, address);
        destination.validate()?;
        let deadline = Instant::now() + self.dial_timeout;

        let channel = FrameChannel::open(&self.endpoint, &destination, self.poll_interval)?;
        let conn = VirtualConn::new(channel.clone(), destination, self.cancel.child(), self.queue_capacity);

        let ret = match channel.wait_open(Some(deadline), &[&self.cancel]) {
            Ok(true) => Ok(()),
            Ok(false) => Err(TunnelError::UpgradeFailed(format!(
                "timed out after {:?} waiting for {}",
                self.dial_timeout, self.endpoint
            ))),
            // opened and already gone again: reads will see the end of stream
            Err(TunnelError::ChannelClosed) if channel.was_opened() => Ok(()),
            Err(e) => Err(e),
        };
        if let Err(e) = ret {
            debug!("dialer: {} via {} failed: {}", conn.destination(), self.endpoint, e);
            let _ = conn.close();
            return Err(e);
        }
        info!("dialer: connected {} via {}", conn.destination(), self.endpoint);
        Ok(conn)
    }
}
