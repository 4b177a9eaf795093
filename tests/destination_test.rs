use wsrelay::protocol::{Destination, TunnelAddr};
use wsrelay::TunnelError;

#[test]
fn test_destination_from_query() {
    let dest = Destination::from_query(Some("network=tcp&address=localhost%3A8443")).unwrap();
    assert_eq!(dest, Destination::new("tcp", "localhost:8443"));
    assert_eq!(dest.to_string(), "tcp/localhost:8443");
}

#[test]
fn test_destination_first_value_wins() {
    let dest = Destination::from_query(Some("address=a:1&network=tcp&address=b:2&network=udp")).unwrap();
    assert_eq!(dest.network, "tcp");
    assert_eq!(dest.address, "a:1");
}

#[test]
fn test_destination_missing_params() {
    for query in [None, Some(""), Some("network=tcp"), Some("address=h:1"), Some("network=&address=h:1")] {
        match Destination::from_query(query) {
            Err(TunnelError::BadRequest(_)) => {}
            other => panic!("query {:?} should be rejected, got {:?}", query, other),
        }
    }
}

#[test]
fn test_channel_url_carries_destination() {
    let dest = Destination::new("tcp", "[::1]:8443");
    let url = dest.channel_url("ws://127.0.0.1:8080/ws").unwrap();
    println!("{}", url);
    assert_eq!(url.path(), "/ws");
    let parsed = Destination::from_query(url.query()).unwrap();
    assert_eq!(parsed, dest);
}

#[test]
fn test_channel_url_rejects_other_schemes() {
    let dest = Destination::new("tcp", "h:1");
    assert!(matches!(dest.channel_url("wss://relay/ws"), Err(TunnelError::UpgradeFailed(_))));
    assert!(matches!(dest.channel_url("not a url"), Err(TunnelError::UpgradeFailed(_))));
}

#[test]
fn test_tunnel_addr() {
    let addr = TunnelAddr::new("localhost:8443");
    assert_eq!(addr.network(), "websocket");
    assert_eq!(addr.address(), "localhost:8443");
    assert_eq!(addr.to_string(), "websocket://localhost:8443");
}
