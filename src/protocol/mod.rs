mod destination;

pub use destination::Destination;
pub use destination::TunnelAddr;
pub use destination::ADDRESS_PARAM;
pub use destination::NETWORK_PARAM;
