mod bridge;
mod connector;
#[cfg(feature = "shell")]
mod shell;

pub use bridge::{CloseGuard, RelaySession, RelayStats, BUFFER_SIZE};
pub use connector::{dial_tcp, Closer, Connector, TcpConnector, Upstream, CONNECT_TIMEOUT};
#[cfg(feature = "shell")]
pub use shell::{PatientWriter, ShellConnector};
