use std::net::TcpListener;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use wsrelay::cancel::CancelToken;
use wsrelay::protocol::Destination;
use wsrelay::transport::{deferred, FrameChannel, Inbound, Outbound, ReadyState};
use wsrelay::TunnelError;

#[derive(Default)]
struct RecordingSink {
    sent: Mutex<Vec<Vec<u8>>>,
    closes: AtomicUsize,
}

impl Outbound for RecordingSink {
    fn send(&self, data: &[u8]) -> wsrelay::Result<()> {
        self.sent.lock().unwrap().push(data.to_vec());
        Ok(())
    }

    fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

fn collect(channel: &FrameChannel) -> (Arc<Mutex<Vec<Vec<u8>>>>, wsrelay::transport::Subscription) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let sub = channel.on_message(move |data| sink.lock().unwrap().push(data));
    (seen, sub)
}

#[test]
fn test_deferred_payload_keeps_order() {
    let (channel, feed) = FrameChannel::detached();
    let (seen, _sub) = collect(&channel);
    let (pending, resolver) = deferred();

    feed.deliver(Inbound::Binary(b"a".to_vec()));
    feed.deliver(Inbound::Deferred(pending));
    feed.deliver(Inbound::Binary(b"c".to_vec()));
    assert_eq!(*seen.lock().unwrap(), vec![b"a".to_vec()]);

    resolver.resolve(b"b".to_vec());
    assert_eq!(*seen.lock().unwrap(), vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
}

#[test]
fn test_deferred_resolved_from_another_thread() {
    let (channel, feed) = FrameChannel::detached();
    let (seen, _sub) = collect(&channel);
    let (first, first_resolver) = deferred();
    let (second, second_resolver) = deferred();

    feed.deliver(Inbound::Deferred(first));
    feed.deliver(Inbound::Deferred(second));
    feed.deliver(Inbound::Binary(vec![3]));

    // the later payload settles first
    thread::spawn(move || second_resolver.resolve(vec![2])).join().unwrap();
    assert!(seen.lock().unwrap().is_empty());
    thread::spawn(move || first_resolver.resolve(vec![1])).join().unwrap();
    assert_eq!(*seen.lock().unwrap(), vec![vec![1], vec![2], vec![3]]);
}

#[test]
fn test_failed_decode_is_dropped() {
    let (channel, feed) = FrameChannel::detached();
    let (seen, _sub) = collect(&channel);
    let (pending, resolver) = deferred();
    let (abandoned, abandoned_resolver) = deferred();

    feed.deliver(Inbound::Deferred(pending));
    feed.deliver(Inbound::Binary(vec![1]));
    feed.deliver(Inbound::Deferred(abandoned));
    feed.deliver(Inbound::Binary(vec![2]));

    resolver.reject("corrupt blob");
    assert_eq!(*seen.lock().unwrap(), vec![vec![1]]);
    drop(abandoned_resolver);
    assert_eq!(*seen.lock().unwrap(), vec![vec![1], vec![2]]);
}

#[test]
fn test_text_is_ignored() {
    let (channel, feed) = FrameChannel::detached();
    let (seen, _sub) = collect(&channel);
    feed.deliver(Inbound::Text(String::from("hello")));
    feed.deliver(Inbound::Binary(vec![9]));
    assert_eq!(*seen.lock().unwrap(), vec![vec![9]]);
}

#[test]
fn test_backlog_reaches_first_subscriber() {
    let (channel, feed) = FrameChannel::detached();
    feed.deliver(Inbound::Binary(vec![1]));
    feed.deliver(Inbound::Binary(vec![2]));
    let (seen, _sub) = collect(&channel);
    feed.deliver(Inbound::Binary(vec![3]));
    assert_eq!(*seen.lock().unwrap(), vec![vec![1], vec![2], vec![3]]);
}

#[test]
fn test_released_subscription_stops_delivery() {
    let (channel, feed) = FrameChannel::detached();
    let (seen, sub) = collect(&channel);
    feed.deliver(Inbound::Binary(vec![1]));
    sub.release();
    feed.deliver(Inbound::Binary(vec![2]));
    assert_eq!(*seen.lock().unwrap(), vec![vec![1]]);
}

#[test]
fn test_send_requires_open() {
    let (channel, feed) = FrameChannel::detached();
    assert_eq!(channel.state(), ReadyState::Connecting);
    assert!(channel.send(b"early").is_err());

    let sink = Arc::new(RecordingSink::default());
    assert!(feed.opened(sink.clone()));
    assert_eq!(channel.state(), ReadyState::Open);
    assert!(channel.was_opened());
    channel.send(b"hello").unwrap();
    assert_eq!(*sink.sent.lock().unwrap(), vec![b"hello".to_vec()]);
}

#[test]
fn test_close_is_idempotent() {
    let (channel, feed) = FrameChannel::detached();
    let sink = Arc::new(RecordingSink::default());
    feed.opened(sink.clone());

    channel.close();
    channel.close();
    assert_eq!(channel.state(), ReadyState::Closing);
    assert_eq!(sink.closes.load(Ordering::SeqCst), 1);
    assert!(matches!(channel.send(b"late"), Err(TunnelError::ChannelClosed)));

    feed.closed();
    assert_eq!(channel.state(), ReadyState::Closed);
    // a late open event cannot resurrect the channel
    assert!(!feed.opened(Arc::new(RecordingSink::default())));
}

#[test]
fn test_wait_open_wakes_on_open() {
    let (channel, feed) = FrameChannel::detached();
    let opener = thread::spawn(move || {
        thread::sleep(Duration::from_millis(150));
        feed.opened(Arc::new(RecordingSink::default()));
    });
    let started = Instant::now();
    let opened = channel.wait_open(Some(Instant::now() + Duration::from_secs(5)), &[]).unwrap();
    assert!(opened);
    assert!(started.elapsed() < Duration::from_secs(2));
    opener.join().unwrap();
}

#[test]
fn test_wait_open_deadline() {
    let (channel, _feed) = FrameChannel::detached();
    let started = Instant::now();
    let opened = channel.wait_open(Some(Instant::now() + Duration::from_millis(120)), &[]).unwrap();
    assert!(!opened);
    assert!(started.elapsed() >= Duration::from_millis(120));
}

#[test]
fn test_wait_open_failure_and_cancel() {
    let (channel, feed) = FrameChannel::detached();
    feed.failed("relay answered 400 Bad Request");
    match channel.wait_open(None, &[]) {
        Err(TunnelError::UpgradeFailed(reason)) => assert!(reason.contains("400")),
        other => panic!("unexpected {:?}", other),
    }

    let (channel, _feed) = FrameChannel::detached();
    let token = CancelToken::new();
    let canceller = token.clone();
    thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        canceller.cancel();
    });
    assert!(matches!(channel.wait_open(None, &[&token]), Err(TunnelError::Cancelled)));
}

#[test]
fn test_open_unreachable_relay() {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let endpoint = format!("ws://127.0.0.1:{}/ws", port);
    let channel = FrameChannel::open(&endpoint, &Destination::new("tcp", "h:1"), Duration::from_millis(20)).unwrap();
    let ret = channel.wait_open(Some(Instant::now() + Duration::from_secs(5)), &[]);
    assert!(matches!(ret, Err(TunnelError::UpgradeFailed(_))), "got {:?}", ret);
    assert_eq!(channel.state(), ReadyState::Closed);
    assert!(!channel.was_opened());
}
