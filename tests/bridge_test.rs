use std::io::{self, ErrorKind, Read, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{select, unbounded, Receiver, Sender};

use wsrelay::cancel::CancelToken;
use wsrelay::protocol::Destination;
use wsrelay::relay::{CloseGuard, Connector, RelaySession, Upstream, BUFFER_SIZE};
use wsrelay::transport::{Packet, Transport};
use wsrelay::TunnelError;

struct MockChannel {
    incoming: Receiver<Packet>,
    sent: Mutex<Vec<Vec<u8>>>,
    closes: AtomicUsize,
    closed: CancelToken,
}

impl MockChannel {
    fn new() -> (Arc<MockChannel>, Sender<Packet>) {
        let (tx, rx) = unbounded();
        let channel = MockChannel {
            incoming: rx,
            sent: Mutex::new(Vec::new()),
            closes: AtomicUsize::new(0),
            closed: CancelToken::new(),
        };
        (Arc::new(channel), tx)
    }

    fn sent_bytes(&self) -> Vec<u8> {
        self.sent.lock().unwrap().concat()
    }
}

impl Transport for MockChannel {
    fn send_packet(&self, data: &[u8]) -> wsrelay::Result<()> {
        if self.closed.is_cancelled() {
            return Err(TunnelError::ChannelClosed);
        }
        self.sent.lock().unwrap().push(data.to_vec());
        Ok(())
    }

    fn read_packet(&self) -> wsrelay::Result<Packet> {
        select! {
            recv(self.incoming) -> packet => packet.map_err(|_| TunnelError::ChannelClosed),
            recv(self.closed.signal()) -> _ => Err(TunnelError::ChannelClosed),
        }
    }

    fn close(&self) -> wsrelay::Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.closed.cancel();
        Ok(())
    }
}

struct PipeReader {
    data: Receiver<Vec<u8>>,
    closed: CancelToken,
    pending: Vec<u8>,
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pending.is_empty() {
            select! {
                recv(self.data) -> data => match data {
                    Ok(data) => self.pending = data,
                    Err(_) => return Ok(0),
                },
                recv(self.closed.signal()) -> _ => return Err(io::Error::new(ErrorKind::BrokenPipe, "closed")),
            }
        }
        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }
}

struct PipeWriter {
    written: Arc<Mutex<Vec<u8>>>,
    closed: CancelToken,
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.closed.is_cancelled() {
            return Err(io::Error::new(ErrorKind::BrokenPipe, "closed"));
        }
        self.written.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct PanickingWriter;

impl Write for PanickingWriter {
    fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
        panic!("upstream writer blew up");
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Test side of a fake upstream connection.
struct UpstreamEnd {
    data: Option<Sender<Vec<u8>>>,
    written: Arc<Mutex<Vec<u8>>>,
    closes: Arc<AtomicUsize>,
}

struct MockConnector {
    dials: AtomicUsize,
    upstream: Mutex<Option<Upstream>>,
}

impl MockConnector {
    fn new() -> (MockConnector, UpstreamEnd) {
        let (tx, rx) = unbounded();
        let closed = CancelToken::new();
        let written = Arc::new(Mutex::new(Vec::new()));
        let closes = Arc::new(AtomicUsize::new(0));
        let reader = PipeReader {
            data: rx,
            closed: closed.clone(),
            pending: Vec::new(),
        };
        let writer = PipeWriter {
            written: written.clone(),
            closed: closed.clone(),
        };
        let counter = closes.clone();
        let upstream = Upstream::new(reader, writer, move || {
            counter.fetch_add(1, Ordering::SeqCst);
            closed.cancel();
        });
        let connector = MockConnector {
            dials: AtomicUsize::new(0),
            upstream: Mutex::new(Some(upstream)),
        };
        (connector, UpstreamEnd { data: Some(tx), written, closes })
    }

    fn failing() -> MockConnector {
        MockConnector {
            dials: AtomicUsize::new(0),
            upstream: Mutex::new(None),
        }
    }
}

impl Connector for MockConnector {
    fn connect(&self, destination: &Destination) -> wsrelay::Result<Upstream> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        match self.upstream.lock().unwrap().take() {
            Some(upstream) => Ok(upstream),
            None => Err(TunnelError::dial_failed(&destination.address, "connection refused")),
        }
    }
}

fn wait_until<F: Fn() -> bool>(what: &str, cond: F) {
    let give_up = Instant::now() + Duration::from_secs(5);
    while !cond() {
        if Instant::now() > give_up {
            panic!("timed out waiting for {}", what);
        }
        thread::sleep(Duration::from_millis(5));
    }
}

fn destination() -> Destination {
    Destination::new("tcp", "127.0.0.1:9")
}

#[test]
fn test_relay_both_directions() {
    let (channel, inbound) = MockChannel::new();
    let (connector, mut far) = MockConnector::new();
    let session = RelaySession::new("t1", destination(), channel.clone());
    let runner = thread::spawn(move || session.run(&connector));

    inbound.send(Packet::Binary(b"hello".to_vec())).unwrap();
    wait_until("upstream write", || *far.written.lock().unwrap() == b"hello");

    let data = far.data.take().unwrap();
    data.send(b"world".to_vec()).unwrap();
    wait_until("channel send", || channel.sent_bytes() == b"world");

    // upstream end of stream ends the session
    drop(data);
    let stats = runner.join().unwrap().unwrap();
    assert_eq!(stats.to_upstream, 5);
    assert_eq!(stats.to_channel, 5);
    assert_eq!(channel.closes.load(Ordering::SeqCst), 1);
    assert_eq!(far.closes.load(Ordering::SeqCst), 1);
}

#[test]
fn test_upstream_chunks_are_bounded() {
    let (channel, _inbound) = MockChannel::new();
    let (connector, mut far) = MockConnector::new();
    let session = RelaySession::new("t2", destination(), channel.clone());
    let runner = thread::spawn(move || session.run(&connector));

    let payload: Vec<u8> = (0..3000u32).map(|i| (i % 256) as u8).collect();
    let data = far.data.take().unwrap();
    data.send(payload.clone()).unwrap();
    drop(data);
    runner.join().unwrap().unwrap();

    let frames = channel.sent.lock().unwrap();
    assert!(frames.iter().all(|f| f.len() <= BUFFER_SIZE));
    assert_eq!(frames.concat(), payload);
}

#[test]
fn test_text_ignored_unless_forwarded() {
    let (channel, inbound) = MockChannel::new();
    let (connector, far) = MockConnector::new();
    let session = RelaySession::new("t3", destination(), channel.clone());
    let token = session.token().clone();
    let runner = thread::spawn(move || session.run(&connector));

    inbound.send(Packet::Text(String::from("ignored"))).unwrap();
    inbound.send(Packet::Binary(b"kept".to_vec())).unwrap();
    wait_until("upstream write", || !far.written.lock().unwrap().is_empty());
    token.cancel();
    runner.join().unwrap().unwrap();
    assert_eq!(*far.written.lock().unwrap(), b"kept");

    let (channel, inbound) = MockChannel::new();
    let (connector, far) = MockConnector::new();
    let session = RelaySession::new("t4", destination(), channel).with_forward_text(true);
    let token = session.token().clone();
    let runner = thread::spawn(move || session.run(&connector));

    inbound.send(Packet::Text(String::from("ls\r"))).unwrap();
    wait_until("upstream write", || *far.written.lock().unwrap() == b"ls\r");
    token.cancel();
    runner.join().unwrap().unwrap();
}

#[test]
fn test_dial_failure_closes_channel() {
    let (channel, _inbound) = MockChannel::new();
    let connector = MockConnector::failing();
    let session = RelaySession::new("t5", destination(), channel.clone());
    match session.run(&connector) {
        Err(TunnelError::DialFailed { address, .. }) => assert_eq!(address, "127.0.0.1:9"),
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(connector.dials.load(Ordering::SeqCst), 1);
    assert_eq!(channel.closes.load(Ordering::SeqCst), 1);
    assert!(channel.sent.lock().unwrap().is_empty());
}

#[test]
fn test_cancel_unblocks_both_directions() {
    let (channel, _inbound) = MockChannel::new();
    let (connector, far) = MockConnector::new();
    let token = CancelToken::new();
    let session = RelaySession::new("t6", destination(), channel.clone()).with_token(token.clone());
    let runner = thread::spawn(move || session.run(&connector));

    // both directions are now parked in blocking reads
    thread::sleep(Duration::from_millis(100));
    let started = Instant::now();
    token.cancel();
    let stats = runner.join().unwrap().unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(stats.to_upstream + stats.to_channel, 0);
    assert_eq!(channel.closes.load(Ordering::SeqCst), 1);
    assert_eq!(far.closes.load(Ordering::SeqCst), 1);
}

#[test]
fn test_channel_error_ends_session() {
    let (channel, inbound) = MockChannel::new();
    let (connector, far) = MockConnector::new();
    let session = RelaySession::new("t7", destination(), channel.clone());
    let runner = thread::spawn(move || session.run(&connector));

    drop(inbound);
    runner.join().unwrap().unwrap();
    assert_eq!(channel.closes.load(Ordering::SeqCst), 1);
    assert_eq!(far.closes.load(Ordering::SeqCst), 1);
}

#[test]
fn test_close_guard_runs_once() {
    let count = Arc::new(AtomicUsize::new(0));
    let counter = count.clone();
    let guard = CloseGuard::new(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    assert!(guard.close());
    assert!(!guard.close());
    drop(guard);
    assert_eq!(count.load(Ordering::SeqCst), 1);

    let counter = count.clone();
    drop(CloseGuard::new(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    }));
    assert_eq!(count.load(Ordering::SeqCst), 2);
}

#[test]
fn test_panicking_direction_ends_session() {
    let (channel, inbound) = MockChannel::new();
    let (_data, rx) = unbounded::<Vec<u8>>();
    let closed = CancelToken::new();
    let closes = Arc::new(AtomicUsize::new(0));
    let reader = PipeReader {
        data: rx,
        closed: closed.clone(),
        pending: Vec::new(),
    };
    let counter = closes.clone();
    let upstream = Upstream::new(reader, PanickingWriter, move || {
        counter.fetch_add(1, Ordering::SeqCst);
        closed.cancel();
    });
    let connector = MockConnector {
        dials: AtomicUsize::new(0),
        upstream: Mutex::new(Some(upstream)),
    };
    let session = RelaySession::new("t8", destination(), channel.clone());
    let runner = thread::spawn(move || session.run(&connector));

    inbound.send(Packet::Binary(b"boom".to_vec())).unwrap();
    // the other direction is parked in a read and must be stopped
    let stats = runner.join().unwrap().unwrap();
    assert_eq!(stats.to_upstream, 0);
    assert_eq!(channel.closes.load(Ordering::SeqCst), 1);
    assert_eq!(closes.load(Ordering::SeqCst), 1);
}
