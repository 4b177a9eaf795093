use crate::error::Result;

/// One message received from a frame channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Binary(Vec<u8>),
    Text(String),
}

impl Packet {
    pub fn len(&self) -> usize {
        match self {
            Packet::Binary(data) => data.len(),
            Packet::Text(text) => text.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Relay-side view of an upgraded message channel: {send, receive, close}.
///
/// Implementations must allow one thread to block in `read_packet` while
/// another calls `send_packet`. A closed channel reads as
/// `TunnelError::ChannelClosed`.
pub trait Transport: Send + Sync {
    fn send_packet(&self, data: &[u8]) -> Result<()>;
    fn read_packet(&self) -> Result<Packet>;
    fn close(&self) -> Result<()>;
}
