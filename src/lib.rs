//! Byte-stream tunneling over WebSocket channels.
//!
//! A relay terminates WebSocket channels and bridges each one to a real
//! destination connection. On the client side [`conn::VirtualConn`] makes a
//! channel behave like a socket, so TLS or any other stream protocol can run
//! over it unchanged.

pub mod cancel;
pub mod conn;
pub mod error;
pub mod protocol;
pub mod relay;
pub mod secure;
pub mod serve;
pub mod transport;
pub mod utils;

pub mod client;
pub mod hello;
pub mod option;
pub mod server;

pub use error::{Result, TunnelError};
