use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::select;

use wsrelay::cancel::CancelToken;

#[test]
fn test_cancel_once() {
    let token = CancelToken::new();
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    token.on_cancel(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    assert!(!token.is_cancelled());
    assert!(token.cancel());
    assert!(!token.cancel());
    assert!(token.is_cancelled());
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    // late hooks run at once
    let counter = hits.clone();
    token.on_cancel(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[test]
fn test_signal_wakes_select() {
    let token = CancelToken::new();
    let canceller = token.clone();
    thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        canceller.cancel();
    });
    let woke = select! {
        recv(token.signal()) -> _ => true,
        recv(crossbeam_channel::after(Duration::from_secs(5))) -> _ => false,
    };
    assert!(woke);
}

#[test]
fn test_child_follows_parent() {
    let parent = CancelToken::new();
    let child = parent.child();
    let sibling = parent.child();

    assert!(sibling.cancel());
    assert!(!parent.is_cancelled());
    assert!(!child.is_cancelled());

    parent.cancel();
    assert!(child.is_cancelled());
}
