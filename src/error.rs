use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, TunnelError>;

/// Failures of the tunnel, on either the relay or the client side.
#[derive(Error, Debug)]
pub enum TunnelError {
    /// Destination parameters missing or malformed. Relay only.
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("channel upgrade failed: {0}")]
    UpgradeFailed(String),

    #[error("dial {address} failed: {reason}")]
    DialFailed { address: String, reason: String },

    #[error("read timeout exceeded")]
    ReadTimeout,

    #[error("write timeout exceeded")]
    WriteTimeout,

    #[error("operation cancelled")]
    Cancelled,

    #[error("connection closed")]
    ChannelClosed,

    #[error("transport error: {0}")]
    Transport(#[source] io::Error),

    #[error("tls handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("invalid certificate material: {0}")]
    InvalidMaterial(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl TunnelError {
    pub fn dial_failed(address: &str, reason: impl ToString) -> Self {
        TunnelError::DialFailed {
            address: address.to_owned(),
            reason: reason.to_string(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, TunnelError::ReadTimeout | TunnelError::WriteTimeout)
    }

    /// Recovers the tunnel error carried inside an `io::Error` produced by
    /// the `Read`/`Write` impls, if any.
    pub fn from_io(err: &io::Error) -> Option<&TunnelError> {
        err.get_ref().and_then(|inner| inner.downcast_ref::<TunnelError>())
    }
}

impl From<io::Error> for TunnelError {
    fn from(err: io::Error) -> Self {
        TunnelError::Transport(err)
    }
}

impl From<tungstenite::Error> for TunnelError {
    fn from(err: tungstenite::Error) -> Self {
        match err {
            tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => TunnelError::ChannelClosed,
            tungstenite::Error::Io(e) => TunnelError::Transport(e),
            other => TunnelError::Transport(io::Error::new(io::ErrorKind::Other, other.to_string())),
        }
    }
}

impl From<openssl::error::ErrorStack> for TunnelError {
    fn from(err: openssl::error::ErrorStack) -> Self {
        TunnelError::InvalidMaterial(err.to_string())
    }
}

impl From<native_tls::Error> for TunnelError {
    fn from(err: native_tls::Error) -> Self {
        TunnelError::InvalidMaterial(err.to_string())
    }
}

impl From<TunnelError> for io::Error {
    fn from(err: TunnelError) -> Self {
        let err = match err {
            TunnelError::Transport(e) => return e,
            other => other,
        };
        let kind = match &err {
            TunnelError::Transport(_) => io::ErrorKind::Other,
            TunnelError::ReadTimeout | TunnelError::WriteTimeout => io::ErrorKind::TimedOut,
            TunnelError::ChannelClosed => io::ErrorKind::NotConnected,
            TunnelError::BadRequest(_) => io::ErrorKind::InvalidInput,
            TunnelError::DialFailed { .. } | TunnelError::UpgradeFailed(_) => io::ErrorKind::ConnectionRefused,
            TunnelError::InvalidMaterial(_) | TunnelError::Config(_) => io::ErrorKind::InvalidData,
            // never Interrupted: read_exact and write_all would retry forever
            TunnelError::Cancelled | TunnelError::HandshakeFailed(_) => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}
