use std::collections::VecDeque;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use log::{debug, warn};
use tungstenite::protocol::Role;
use tungstenite::HandshakeError;
use url::Url;

use super::base::Packet;
use super::websocket::{Wire, WsSocket};
use crate::cancel::CancelToken;
use crate::error::{Result, TunnelError};
use crate::protocol::Destination;

/// Longest single wait on the state condvar, so cancellation is noticed.
const WAIT_SLICE: Duration = Duration::from_millis(100);

/// Lifecycle of a message channel. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Where outgoing frames of an open channel go.
pub trait Outbound: Send + Sync + 'static {
    fn send(&self, data: &[u8]) -> Result<()>;

    /// Starts sending `data` and returns at once. The receiver yields the
    /// outcome. A frame whose outcome is never awaited may still go out.
    fn submit(self: Arc<Self>, data: Vec<u8>) -> Receiver<Result<()>> {
        let (ack, receipt) = crossbeam_channel::bounded(1);
        let spawned = thread::Builder::new().name(String::from("outbound send")).spawn(move || {
            let _ = ack.send(self.send(&data));
        });
        match spawned {
            Ok(_) => receipt,
            Err(e) => settled(Err(TunnelError::Transport(e))),
        }
    }

    fn close(&self);
}

/// A receiver that already holds `outcome`.
pub(crate) fn settled(outcome: Result<()>) -> Receiver<Result<()>> {
    let (ack, receipt) = crossbeam_channel::bounded(1);
    let _ = ack.send(outcome);
    receipt
}

/// A message as it arrives from the channel's event source.
pub enum Inbound {
    Binary(Vec<u8>),
    Text(String),
    /// A payload that needs an extra asynchronous step before its bytes exist.
    Deferred(PendingPayload),
}

type OnReady = Box<dyn FnOnce(Vec<u8>) + Send>;
type OnFailed = Box<dyn FnOnce(String) + Send>;

enum Settlement {
    Pending(Option<(OnReady, OnFailed)>),
    Ready(Vec<u8>),
    Failed(String),
    Done,
}

/// The consuming half of a deferred payload. Settled through a
/// success/failure callback pair registered with [`PendingPayload::then`].
pub struct PendingPayload {
    state: Arc<Mutex<Settlement>>,
}

/// The producing half of a deferred payload. Dropping it unsettled rejects
/// the payload.
pub struct PayloadResolver {
    state: Option<Arc<Mutex<Settlement>>>,
}

pub fn deferred() -> (PendingPayload, PayloadResolver) {
    let state = Arc::new(Mutex::new(Settlement::Pending(None)));
    (
        PendingPayload { state: state.clone() },
        PayloadResolver { state: Some(state) },
    )
}

impl PendingPayload {
    /// Registers the callback pair. If the payload has already settled the
    /// matching callback runs on the calling thread.
    pub fn then<S, F>(self, on_ready: S, on_failed: F)
    where
        S: FnOnce(Vec<u8>) + Send + 'static,
        F: FnOnce(String) + Send + 'static,
    {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match std::mem::replace(&mut *state, Settlement::Done) {
            Settlement::Ready(data) => {
                drop(state);
                on_ready(data);
            }
            Settlement::Failed(reason) => {
                drop(state);
                on_failed(reason);
            }
            Settlement::Pending(_) => {
                *state = Settlement::Pending(Some((Box::new(on_ready), Box::new(on_failed))));
            }
            Settlement::Done => {}
        }
    }
}

impl PayloadResolver {
    pub fn resolve(mut self, data: Vec<u8>) {
        self.settle(Ok(data));
    }

    pub fn reject(mut self, reason: &str) {
        self.settle(Err(reason.to_owned()));
    }

    fn settle(&mut self, outcome: std::result::Result<Vec<u8>, String>) {
        let Some(state) = self.state.take() else { return };
        let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
        match std::mem::replace(&mut *state, Settlement::Done) {
            Settlement::Pending(Some((on_ready, on_failed))) => {
                drop(state);
                match outcome {
                    Ok(data) => on_ready(data),
                    Err(reason) => on_failed(reason),
                }
            }
            Settlement::Pending(None) => {
                *state = match outcome {
                    Ok(data) => Settlement::Ready(data),
                    Err(reason) => Settlement::Failed(reason),
                };
            }
            other => *state = other,
        }
    }
}

impl Drop for PayloadResolver {
    fn drop(&mut self) {
        self.settle(Err(String::from("payload abandoned")));
    }
}

type Handler = Box<dyn FnMut(Vec<u8>) + Send>;

enum Slot {
    Ready(Vec<u8>),
    Waiting(u64),
    Skipped,
}

/// Arrival-ordered delivery. A waiting deferred slot holds back every slot
/// behind it.
struct Dispatch {
    slots: VecDeque<Slot>,
    next_ticket: u64,
    handler: Option<Handler>,
    released: bool,
}

impl Dispatch {
    fn flush(&mut self) {
        loop {
            match self.slots.front() {
                None | Some(Slot::Waiting(_)) => break,
                Some(Slot::Skipped) => {
                    self.slots.pop_front();
                }
                Some(Slot::Ready(_)) => {
                    let Some(handler) = self.handler.as_mut() else { break };
                    if let Some(Slot::Ready(data)) = self.slots.pop_front() {
                        handler(data);
                    }
                }
            }
        }
    }

    fn release(&mut self) {
        self.released = true;
        self.handler = None;
        self.slots.clear();
    }
}

struct Core {
    state: Mutex<ReadyState>,
    state_changed: Condvar,
    failure: Mutex<Option<String>>,
    outbound: Mutex<Option<Arc<dyn Outbound>>>,
    dispatch: Mutex<Dispatch>,
    opened: AtomicBool,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Core {
    fn state(&self) -> ReadyState {
        *lock(&self.state)
    }

    fn set_state(&self, next: ReadyState) {
        let mut state = lock(&self.state);
        if *state == ReadyState::Closed {
            return;
        }
        *state = next;
        self.state_changed.notify_all();
    }

    fn failure(&self) -> TunnelError {
        match lock(&self.failure).as_ref() {
            Some(reason) => TunnelError::UpgradeFailed(reason.clone()),
            None => TunnelError::ChannelClosed,
        }
    }

    fn deliver(self: &Arc<Self>, inbound: Inbound) {
        match inbound {
            Inbound::Binary(data) => {
                let mut dispatch = lock(&self.dispatch);
                if dispatch.released {
                    return;
                }
                dispatch.slots.push_back(Slot::Ready(data));
                dispatch.flush();
            }
            Inbound::Text(text) => {
                debug!("channel: ignoring text message of {} bytes", text.len());
            }
            Inbound::Deferred(payload) => {
                let ticket = {
                    let mut dispatch = lock(&self.dispatch);
                    if dispatch.released {
                        return;
                    }
                    let ticket = dispatch.next_ticket;
                    dispatch.next_ticket += 1;
                    dispatch.slots.push_back(Slot::Waiting(ticket));
                    ticket
                };
                let on_ready = Arc::downgrade(self);
                let on_failed = on_ready.clone();
                payload.then(
                    move |data| {
                        if let Some(core) = on_ready.upgrade() {
                            core.settle(ticket, Some(data));
                        }
                    },
                    move |reason| {
                        warn!("channel: failed converting payload: {}", reason);
                        if let Some(core) = on_failed.upgrade() {
                            core.settle(ticket, None);
                        }
                    },
                );
            }
        }
    }

    fn settle(&self, ticket: u64, data: Option<Vec<u8>>) {
        let mut dispatch = lock(&self.dispatch);
        let Some(slot) = dispatch.slots.iter_mut().find(|s| matches!(s, Slot::Waiting(t) if *t == ticket)) else {
            return;
        };
        *slot = match data {
            Some(data) => Slot::Ready(data),
            None => Slot::Skipped,
        };
        dispatch.flush();
    }
}

/// Consumer face of a message channel: observe state, subscribe to messages,
/// send, close.
#[derive(Clone)]
pub struct FrameChannel {
    core: Arc<Core>,
}

/// Event face of a message channel, used by whatever drives it.
#[derive(Clone)]
pub struct ChannelFeed {
    core: Arc<Core>,
}

/// Keeps a message handler registered. Released explicitly or on drop.
pub struct Subscription {
    core: Weak<Core>,
}

impl Subscription {
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(core) = self.core.upgrade() {
            lock(&core.dispatch).release();
        }
    }
}

impl FrameChannel {
    /// A channel in `Connecting` state whose events are fired through the
    /// returned feed.
    pub fn detached() -> (FrameChannel, ChannelFeed) {
        let core = Arc::new(Core {
            state: Mutex::new(ReadyState::Connecting),
            state_changed: Condvar::new(),
            failure: Mutex::new(None),
            outbound: Mutex::new(None),
            dispatch: Mutex::new(Dispatch {
                slots: VecDeque::new(),
                next_ticket: 0,
                handler: None,
                released: false,
            }),
            opened: AtomicBool::new(false),
        });
        (FrameChannel { core: core.clone() }, ChannelFeed { core })
    }

    /// Opens a WebSocket channel to `endpoint` carrying `destination` in the
    /// upgrade request. Returns at once in `Connecting` state; the handshake
    /// and the receive loop run on a pump thread.
    pub fn open(endpoint: &str, destination: &Destination, poll_interval: Duration) -> Result<FrameChannel> {
        let url = destination.channel_url(endpoint)?;
        let (channel, feed) = FrameChannel::detached();
        debug!("channel: opening {}", url);
        thread::Builder::new()
            .name(format!("channel {}", destination))
            .spawn(move || pump(url, feed, poll_interval))?;
        Ok(channel)
    }

    pub fn state(&self) -> ReadyState {
        self.core.state()
    }

    /// Whether the channel ever reached `Open`.
    pub fn was_opened(&self) -> bool {
        self.core.opened.load(Ordering::SeqCst)
    }

    /// The error describing why the channel is not usable.
    pub fn failure(&self) -> TunnelError {
        self.core.failure()
    }

    /// Registers the message handler. Messages that arrived before any
    /// subscription are handed over first, in order.
    pub fn on_message<F>(&self, handler: F) -> Subscription
    where
        F: FnMut(Vec<u8>) + Send + 'static,
    {
        let mut dispatch = lock(&self.core.dispatch);
        dispatch.handler = Some(Box::new(handler));
        dispatch.flush();
        Subscription {
            core: Arc::downgrade(&self.core),
        }
    }

    /// Sends one binary frame. Only valid while `Open`.
    pub fn send(&self, data: &[u8]) -> Result<()> {
        self.submit(data)?
            .recv()
            .unwrap_or(Err(TunnelError::ChannelClosed))
    }

    /// Hands one binary frame to the outbound side without waiting for it.
    /// Only valid while `Open`.
    pub fn submit(&self, data: &[u8]) -> Result<Receiver<Result<()>>> {
        if self.state() != ReadyState::Open {
            return Err(self.failure());
        }
        let outbound = lock(&self.core.outbound).clone();
        match outbound {
            Some(outbound) => Ok(outbound.submit(data.to_vec())),
            None => Err(TunnelError::ChannelClosed),
        }
    }

    /// Requests the channel to close. Idempotent.
    pub fn close(&self) {
        {
            let mut state = lock(&self.core.state);
            match *state {
                ReadyState::Connecting | ReadyState::Open => {
                    *state = ReadyState::Closing;
                    self.core.state_changed.notify_all();
                }
                ReadyState::Closing | ReadyState::Closed => return,
            }
        }
        let outbound = lock(&self.core.outbound).take();
        if let Some(outbound) = outbound {
            outbound.close();
        }
    }

    /// Waits for `Open`. `Ok(false)` means the deadline passed first; a
    /// closing or closed channel fails fast.
    pub fn wait_open(&self, deadline: Option<Instant>, cancel: &[&CancelToken]) -> Result<bool> {
        let mut state = lock(&self.core.state);
        loop {
            match *state {
                ReadyState::Open => return Ok(true),
                ReadyState::Closing | ReadyState::Closed => {
                    drop(state);
                    return Err(self.failure());
                }
                ReadyState::Connecting => {}
            }
            if cancel.iter().any(|token| token.is_cancelled()) {
                return Err(TunnelError::Cancelled);
            }
            let mut slice = WAIT_SLICE;
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if deadline <= now {
                    return Ok(false);
                }
                slice = slice.min(deadline - now);
            }
            state = match self.core.state_changed.wait_timeout(state, slice) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }
}

impl ChannelFeed {
    /// The channel reached `Open`. Returns `false` when a close was requested
    /// while connecting; the caller should then tear the connection down.
    pub fn opened(&self, outbound: Arc<dyn Outbound>) -> bool {
        let mut state = lock(&self.core.state);
        if *state != ReadyState::Connecting {
            return false;
        }
        *lock(&self.core.outbound) = Some(outbound);
        self.core.opened.store(true, Ordering::SeqCst);
        *state = ReadyState::Open;
        self.core.state_changed.notify_all();
        true
    }

    pub fn deliver(&self, inbound: Inbound) {
        self.core.deliver(inbound);
    }

    /// The channel could not be opened.
    pub fn failed(&self, reason: &str) {
        *lock(&self.core.failure) = Some(reason.to_owned());
        lock(&self.core.dispatch).release();
        self.core.set_state(ReadyState::Closed);
    }

    /// The channel went away. Ready messages still reach the subscriber;
    /// deferred ones that have not settled are dropped.
    pub fn closed(&self) {
        lock(&self.core.outbound).take();
        {
            let mut dispatch = lock(&self.core.dispatch);
            dispatch.flush();
            dispatch.release();
        }
        self.core.set_state(ReadyState::Closed);
    }

    pub fn state(&self) -> ReadyState {
        self.core.state()
    }
}

fn connect(url: &Url, poll_interval: Duration) -> std::result::Result<WsSocket, String> {
    let host = url.host_str().ok_or_else(|| String::from("endpoint has no host"))?;
    let port = url.port_or_known_default().unwrap_or(80);
    let stream = TcpStream::connect((host, port)).map_err(|e| format!("connect {}:{}: {}", host, port, e))?;
    let (socket, response) = tungstenite::client(url.as_str(), Wire::new(stream)).map_err(|e| match e {
        HandshakeError::Failure(tungstenite::Error::Http(resp)) => format!("relay answered {}", resp.status()),
        HandshakeError::Failure(e) => e.to_string(),
        HandshakeError::Interrupted(_) => String::from("handshake interrupted"),
    })?;
    debug!("channel: handshake done, status {}", response.status());
    WsSocket::new(socket, Role::Client, poll_interval).map_err(|e| e.to_string())
}

fn pump(url: Url, feed: ChannelFeed, poll_interval: Duration) {
    let socket = match connect(&url, poll_interval) {
        Ok(socket) => Arc::new(socket),
        Err(reason) => {
            debug!("channel: open failed: {}", reason);
            feed.failed(&reason);
            return;
        }
    };
    if !feed.opened(socket.clone()) {
        socket.close();
        feed.closed();
        return;
    }
    debug!("channel: open");
    loop {
        match socket.recv() {
            Ok(Packet::Binary(data)) => feed.deliver(Inbound::Binary(data)),
            Ok(Packet::Text(text)) => feed.deliver(Inbound::Text(text)),
            Err(e) => {
                debug!("channel: receive loop exit: {}", e);
                break;
            }
        }
    }
    socket.close();
    feed.closed();
}
