mod base;
mod channel;
mod websocket;

pub use base::Packet;
pub use base::Transport;

pub use channel::deferred;
pub use channel::ChannelFeed;
pub use channel::FrameChannel;
pub use channel::Inbound;
pub use channel::Outbound;
pub use channel::PayloadResolver;
pub use channel::PendingPayload;
pub use channel::ReadyState;
pub use channel::Subscription;

pub use websocket::Wire;
pub use websocket::WsSocket;
pub use websocket::POLL_INTERVAL;
