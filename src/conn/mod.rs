mod deadline;
mod dialer;
mod virtual_conn;

pub use deadline::{expired, Deadlines};
pub use dialer::{Dialer, DIAL_TIMEOUT};
pub use virtual_conn::{VirtualConn, QUEUE_CAPACITY};
