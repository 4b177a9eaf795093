use std::fmt;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use crossbeam_channel::{select, Receiver};
use log::debug;

use super::deadline::{expired, Deadlines};
use crate::cancel::CancelToken;
use crate::error::{Result, TunnelError};
use crate::protocol::{Destination, TunnelAddr};
use crate::transport::{FrameChannel, Subscription};

/// Default bound of the inbound chunk queue.
pub const QUEUE_CAPACITY: usize = 10;

/// Bytes already taken off the queue but not yet handed to a caller.
struct Residual {
    current: Vec<u8>,
    current_pos: usize,
}

impl Residual {
    fn drain_into(&mut self, buf: &mut [u8]) -> usize {
        let remaining = self.current.len() - self.current_pos;
        let to_fill = std::cmp::min(remaining, buf.len());
        buf[..to_fill].copy_from_slice(&self.current[self.current_pos..(self.current_pos + to_fill)]);
        self.current_pos += to_fill;
        to_fill
    }

    fn refill(&mut self, chunk: Vec<u8>) {
        self.current = chunk;
        self.current_pos = 0;
    }
}

struct ConnInner {
    channel: FrameChannel,
    destination: Destination,
    inbound: Receiver<Vec<u8>>,
    residual: Mutex<Residual>,
    deadlines: Deadlines,
    cancel: CancelToken,
    closing: CancelToken,
    subscription: Mutex<Option<Subscription>>,
}

impl Drop for ConnInner {
    fn drop(&mut self) {
        self.channel.close();
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A byte stream socket carried over a message channel.
///
/// Reads are served from the residual bytes of the last chunk first, then
/// from the bounded inbound queue fed by the channel's message handler,
/// racing the read deadline and cancellation. Writes send each buffer as one
/// binary frame once the channel is open.
///
/// All methods take `&self`; handles made with [`VirtualConn::try_clone`]
/// share the same connection.
pub struct VirtualConn {
    inner: Arc<ConnInner>,
}

impl VirtualConn {
    /// Wraps `channel`. `cancel` bounds the lifetime of the connection.
    pub fn new(channel: FrameChannel, destination: Destination, cancel: CancelToken, capacity: usize) -> Self {
        let (tx, rx) = crossbeam_channel::bounded::<Vec<u8>>(capacity.max(1));
        let closing = CancelToken::new();
        let stop_closing = closing.clone();
        let stop_cancel = cancel.clone();
        // the producer blocks while the queue is full
        let subscription = channel.on_message(move |chunk| {
            select! {
                send(tx, chunk) -> ret => {
                    if ret.is_err() {
                        debug!("conn: inbound queue dropped");
                    }
                },
                recv(stop_closing.signal()) -> _ => {},
                recv(stop_cancel.signal()) -> _ => {},
            }
        });

        VirtualConn {
            inner: Arc::new(ConnInner {
                channel,
                destination,
                inbound: rx,
                residual: Mutex::new(Residual {
                    current: Vec::new(),
                    current_pos: 0,
                }),
                deadlines: Deadlines::new(),
                cancel,
                closing,
                subscription: Mutex::new(Some(subscription)),
            }),
        }
    }

    pub fn try_clone(&self) -> Option<Self> {
        Some(VirtualConn {
            inner: self.inner.clone(),
        })
    }

    pub fn destination(&self) -> &Destination {
        &self.inner.destination
    }

    pub fn channel(&self) -> &FrameChannel {
        &self.inner.channel
    }

    fn check_usable(&self) -> Result<()> {
        if self.inner.closing.is_cancelled() {
            return Err(TunnelError::ChannelClosed);
        }
        if self.inner.cancel.is_cancelled() {
            return Err(TunnelError::Cancelled);
        }
        Ok(())
    }

    /// Reads into `buf`. `Ok(0)` means the peer closed the channel and all
    /// queued data has been consumed.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut residual = lock(&self.inner.residual);
        let n = residual.drain_into(buf);
        if n > 0 {
            return Ok(n);
        }
        self.check_usable()?;

        loop {
            let deadline = self.inner.deadlines.read();
            if expired(deadline) {
                return Err(TunnelError::ReadTimeout);
            }
            let timer = match deadline {
                Some(d) => crossbeam_channel::at(d),
                None => crossbeam_channel::never::<Instant>(),
            };
            select! {
                recv(self.inner.inbound) -> chunk => match chunk {
                    Ok(chunk) if chunk.is_empty() => continue,
                    Ok(chunk) => {
                        residual.refill(chunk);
                        return Ok(residual.drain_into(buf));
                    }
                    Err(_) if self.inner.closing.is_cancelled() => return Err(TunnelError::ChannelClosed),
                    Err(_) if self.inner.channel.was_opened() => return Ok(0),
                    Err(_) => return Err(self.inner.channel.failure()),
                },
                recv(self.inner.deadlines.changed()) -> _ => continue,
                recv(timer) -> _ => return Err(TunnelError::ReadTimeout),
                recv(self.inner.cancel.signal()) -> _ => return Err(TunnelError::Cancelled),
                recv(self.inner.closing.signal()) -> _ => return Err(TunnelError::ChannelClosed),
            }
        }
    }

    /// Sends all of `buf` as one binary frame, waiting for the channel to
    /// open first. Success means the channel wrote the frame out. A write cut
    /// short by its deadline or by cancellation may still deliver the frame.
    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        let deadline = self.inner.deadlines.write();
        if expired(deadline) {
            return Err(TunnelError::WriteTimeout);
        }
        self.check_usable()?;
        if buf.is_empty() {
            return Ok(0);
        }
        match self.inner.channel.wait_open(deadline, &[&self.inner.cancel, &self.inner.closing]) {
            Ok(true) => {}
            Ok(false) => return Err(TunnelError::WriteTimeout),
            Err(TunnelError::Cancelled) if self.inner.closing.is_cancelled() => {
                return Err(TunnelError::ChannelClosed)
            }
            Err(e) => return Err(e),
        }
        let receipt = self.inner.channel.submit(buf)?;
        let timer = match deadline {
            Some(d) => crossbeam_channel::at(d),
            None => crossbeam_channel::never::<Instant>(),
        };
        select! {
            recv(receipt) -> ret => match ret {
                Ok(Ok(())) => Ok(buf.len()),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(TunnelError::ChannelClosed),
            },
            recv(timer) -> _ => Err(TunnelError::WriteTimeout),
            recv(self.inner.cancel.signal()) -> _ => Err(TunnelError::Cancelled),
            recv(self.inner.closing.signal()) -> _ => Err(TunnelError::ChannelClosed),
        }
    }

    /// Releases the message subscription and closes the channel. Idempotent.
    pub fn close(&self) -> Result<()> {
        if !self.inner.closing.cancel() {
            return Ok(());
        }
        debug!("conn: close {}", self.inner.destination);
        if let Some(subscription) = lock(&self.inner.subscription).take() {
            subscription.release();
        }
        self.inner.channel.close();
        Ok(())
    }

    pub fn local_addr(&self) -> TunnelAddr {
        TunnelAddr::new("client")
    }

    pub fn remote_addr(&self) -> TunnelAddr {
        TunnelAddr::new(&self.inner.destination.address)
    }

    pub fn set_deadline(&self, deadline: Option<Instant>) {
        self.inner.deadlines.set_read(deadline);
        self.inner.deadlines.set_write(deadline);
    }

    pub fn set_read_deadline(&self, deadline: Option<Instant>) {
        self.inner.deadlines.set_read(deadline);
    }

    pub fn set_write_deadline(&self, deadline: Option<Instant>) {
        self.inner.deadlines.set_write(deadline);
    }
}

impl fmt::Debug for VirtualConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualConn")
            .field("destination", &self.inner.destination)
            .field("state", &self.inner.channel.state())
            .finish()
    }
}

impl Read for VirtualConn {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        VirtualConn::read(self, buf).map_err(io::Error::from)
    }
}

impl Read for &VirtualConn {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        VirtualConn::read(self, buf).map_err(io::Error::from)
    }
}

impl Write for VirtualConn {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        VirtualConn::write(self, buf).map_err(io::Error::from)
    }

    fn flush(&mut self) -> io::Result<()> {
        // frames are handed to the channel as they are written
        Ok(())
    }
}

impl Write for &VirtualConn {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        VirtualConn::write(self, buf).map_err(io::Error::from)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
