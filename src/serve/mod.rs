mod websocket;

pub use websocket::{DestinationSource, RelayListener, Route};
