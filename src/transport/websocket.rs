use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{select, Receiver, Sender};
use log::debug;
use tungstenite::protocol::Role;
use tungstenite::{Message, WebSocket};

use super::base::{Packet, Transport};
use super::channel::{settled, Outbound};
use crate::cancel::CancelToken;
use crate::error::{Result, TunnelError};

pub const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Socket timeouts of zero are rejected by the OS.
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// How long the writer keeps trying to deliver a close frame.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

enum Outgoing {
    Binary(Vec<u8>, Sender<Result<()>>),
    /// Frames already encoded by the receiving half (pong and close replies).
    Raw(Vec<u8>),
    /// Also serves as the reply to a close frame from the peer, since the
    /// receiving half stops reading as soon as it sees one.
    Close,
}

/// The stream under the receiving half of a [`WsSocket`].
///
/// Until the socket is built it is a plain TCP stream, so the upgrade
/// handshake runs over it. Afterwards everything the receiving half writes
/// is handed to the writer thread as whole frames.
pub struct Wire {
    stream: TcpStream,
    divert: Option<Sender<Outgoing>>,
}

impl Wire {
    pub fn new(stream: TcpStream) -> Self {
        Wire { stream, divert: None }
    }

    pub fn get_ref(&self) -> &TcpStream {
        &self.stream
    }
}

impl Read for Wire {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }
}

impl Write for Wire {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &self.divert {
            Some(divert) => {
                divert
                    .send(Outgoing::Raw(buf.to_vec()))
                    .map_err(|_| io::Error::from(ErrorKind::BrokenPipe))?;
                Ok(buf.len())
            }
            None => self.stream.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.divert {
            Some(_) => Ok(()),
            None => self.stream.flush(),
        }
    }
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted)
}

/// A WebSocket with independent halves.
///
/// One thread receives; sends are queued to a writer thread that owns the
/// sending half. A send blocked on a peer that does not read therefore never
/// holds up receiving, and `close` never waits for it.
///
/// The socket runs with short read and write timeouts. While no complete
/// message is buffered, the receiver waits for readability on a clone of the
/// raw stream without holding the receive lock.
pub struct WsSocket {
    reader: Mutex<WebSocket<Wire>>,
    raw: TcpStream,
    outgoing: Sender<Outgoing>,
    starved: AtomicBool,
    closed: AtomicBool,
    closing: CancelToken,
}

impl WsSocket {
    pub fn new(mut socket: WebSocket<Wire>, role: Role, poll_interval: Duration) -> Result<Self> {
        let poll_interval = poll_interval.max(MIN_POLL_INTERVAL);
        let raw = socket.get_ref().stream.try_clone()?;
        raw.set_read_timeout(Some(poll_interval))?;
        raw.set_write_timeout(Some(poll_interval))?;
        raw.set_nodelay(true)?;

        let (outgoing, queue) = crossbeam_channel::unbounded();
        let writer = WebSocket::from_raw_socket(raw.try_clone()?, role, None);
        let closing = CancelToken::new();
        {
            let closing = closing.clone();
            thread::Builder::new()
                .name(String::from("ws writer"))
                .spawn(move || write_loop(writer, queue, closing))?;
        }
        socket.get_mut().divert = Some(outgoing.clone());

        Ok(WsSocket {
            reader: Mutex::new(socket),
            raw,
            outgoing,
            starved: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            closing,
        })
    }

    fn lock(&self) -> MutexGuard<'_, WebSocket<Wire>> {
        self.reader.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Blocks until a data message arrives or the channel goes away.
    pub fn recv(&self) -> Result<Packet> {
        let mut peeked = [0u8; 1];
        loop {
            if self.is_closed() {
                return Err(TunnelError::ChannelClosed);
            }
            if self.starved.load(Ordering::Relaxed) {
                match self.raw.peek(&mut peeked) {
                    Ok(_) => self.starved.store(false, Ordering::Relaxed),
                    Err(e) if is_timeout(&e) => continue,
                    Err(e) => return Err(TunnelError::Transport(e)),
                }
            }

            let ret = self.lock().read();
            match ret {
                Ok(Message::Binary(data)) => return Ok(Packet::Binary(data)),
                Ok(Message::Text(text)) => return Ok(Packet::Text(text)),
                Ok(Message::Close(frame)) => {
                    debug!("websocket close frame received: {:?}", frame);
                    return Err(TunnelError::ChannelClosed);
                }
                Ok(_) => continue,
                Err(tungstenite::Error::Io(e)) if is_timeout(&e) => {
                    self.starved.store(true, Ordering::Relaxed);
                }
                Err(e) => {
                    if self.is_closed() {
                        return Err(TunnelError::ChannelClosed);
                    }
                    return Err(e.into());
                }
            }
        }
    }

    /// Queues one binary frame for the writer. The receiver yields once the
    /// frame has been written out, or the error that stopped it.
    pub fn submit_binary(&self, data: Vec<u8>) -> Result<Receiver<Result<()>>> {
        if self.is_closed() {
            return Err(TunnelError::ChannelClosed);
        }
        let (ack, receipt) = crossbeam_channel::bounded(1);
        self.outgoing
            .send(Outgoing::Binary(data, ack))
            .map_err(|_| TunnelError::ChannelClosed)?;
        Ok(receipt)
    }

    /// Sends one binary frame and waits until it is written or the socket
    /// is closed.
    pub fn send_binary(&self, data: &[u8]) -> Result<()> {
        let receipt = self.submit_binary(data.to_vec())?;
        select! {
            recv(receipt) -> ret => ret.unwrap_or(Err(TunnelError::ChannelClosed)),
            recv(self.closing.signal()) -> _ => Err(TunnelError::ChannelClosed),
        }
    }

    /// Starts the close handshake and returns without waiting for it.
    /// Pending sends fail with `ChannelClosed`. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.outgoing.send(Outgoing::Close).is_err() {
            self.shutdown();
        }
        self.closing.cancel();
    }

    /// Shuts the raw socket down, waking any blocked receiver.
    pub fn shutdown(&self) {
        let _ = self.raw.shutdown(Shutdown::Both);
    }
}

/// Writes until `op` finished or gave up. Timed out writes keep their bytes
/// buffered in the socket and are resumed with `flush`.
fn deliver<F>(ws: &mut WebSocket<TcpStream>, abort: Option<&CancelToken>, give_up: Option<Instant>, op: F) -> Result<()>
where
    F: FnOnce(&mut WebSocket<TcpStream>) -> tungstenite::Result<()>,
{
    let mut ret = op(ws);
    loop {
        match ret {
            Err(tungstenite::Error::Io(e)) if is_timeout(&e) => {
                if abort.map_or(false, CancelToken::is_cancelled) || give_up.map_or(false, |t| Instant::now() >= t) {
                    return Err(TunnelError::ChannelClosed);
                }
                ret = ws.flush();
            }
            other => return other.map_err(TunnelError::from),
        }
    }
}

fn push_raw(stream: &mut TcpStream, mut frames: &[u8], give_up: Instant) -> io::Result<()> {
    while !frames.is_empty() {
        match stream.write(frames) {
            Ok(0) => return Err(io::Error::from(ErrorKind::WriteZero)),
            Ok(n) => frames = &frames[n..],
            Err(e) if is_timeout(&e) && Instant::now() < give_up => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn write_loop(mut ws: WebSocket<TcpStream>, queue: Receiver<Outgoing>, closing: CancelToken) {
    for job in queue.iter() {
        match job {
            Outgoing::Binary(data, ack) => {
                if closing.is_cancelled() {
                    let _ = ack.send(Err(TunnelError::ChannelClosed));
                    continue;
                }
                let ret = deliver(&mut ws, Some(&closing), None, |ws| ws.send(Message::Binary(data)));
                let failed = ret.is_err();
                let _ = ack.send(ret);
                if failed {
                    debug!("websocket writer stopped by a failed send");
                    break;
                }
            }
            Outgoing::Raw(frames) => {
                if let Err(e) = push_raw(ws.get_mut(), &frames, Instant::now() + CLOSE_GRACE) {
                    debug!("websocket control frame: {}", e);
                    break;
                }
            }
            Outgoing::Close => {
                let give_up = Instant::now() + CLOSE_GRACE;
                if let Err(e) = deliver(&mut ws, None, Some(give_up), |ws| ws.close(None)) {
                    debug!("websocket close: {}", e);
                }
                break;
            }
        }
    }
    let _ = ws.get_ref().shutdown(Shutdown::Both);
}

impl Transport for WsSocket {
    fn send_packet(&self, data: &[u8]) -> Result<()> {
        self.send_binary(data)
    }

    fn read_packet(&self) -> Result<Packet> {
        self.recv()
    }

    fn close(&self) -> Result<()> {
        WsSocket::close(self);
        Ok(())
    }
}

impl Outbound for WsSocket {
    fn send(&self, data: &[u8]) -> Result<()> {
        self.send_binary(data)
    }

    fn submit(self: Arc<Self>, data: Vec<u8>) -> Receiver<Result<()>> {
        match self.submit_binary(data) {
            Ok(receipt) => receipt,
            Err(e) => settled(Err(e)),
        }
    }

    fn close(&self) {
        WsSocket::close(self);
    }
}
