use std::sync::Arc;
use std::time::Duration;

use log::info;

use crate::error::Result;
#[cfg(not(feature = "shell"))]
use crate::error::TunnelError;
use crate::option::{RelayOption, RouteOpts};
use crate::protocol::Destination;
use crate::relay::{Connector, TcpConnector};
#[cfg(feature = "shell")]
use crate::relay::ShellConnector;
use crate::serve::{RelayListener, Route};

pub struct RelayServer {
    opts: RelayOption,
}

impl RelayServer {
    pub fn new(opts: RelayOption) -> Self {
        RelayServer { opts }
    }

    pub fn build_routes(&self) -> Result<Vec<Route>> {
        let dial_timeout = Duration::from_secs(self.opts.dial_timeout_secs);
        let tcp: Arc<dyn Connector> = Arc::new(TcpConnector::new(dial_timeout));
        let mut routes = Vec::with_capacity(self.opts.routes.len());
        for opts in &self.opts.routes {
            let route = match opts {
                RouteOpts::Tunnel(t) => Route::tunnel(&t.path, tcp.clone()),
                RouteOpts::Forward(f) => Route::forward(&f.path, Destination::new(&f.network, &f.address), tcp.clone()),
                #[cfg(feature = "shell")]
                RouteOpts::Shell(s) => {
                    let connector = ShellConnector::new(&s.user, &s.resolve_password()?)
                        .with_term(&s.term, s.cols, s.rows)
                        .with_timeout(dial_timeout);
                    Route::shell(&s.path, Destination::new(&s.network, &s.address), connector)
                }
                #[cfg(not(feature = "shell"))]
                RouteOpts::Shell(s) => {
                    return Err(TunnelError::Config(format!(
                        "route {}: built without the 'shell' feature",
                        s.path
                    )))
                }
            };
            info!("route {} => {:?}", route.path, route.source);
            routes.push(route);
        }
        Ok(routes)
    }

    pub fn bootstrap(&self) -> Result<()> {
        let poll_interval = self.opts.poll_interval()?;
        let routes = self.build_routes()?;
        let addr = format!("{}:{}", self.opts.listen_addr, self.opts.listen_port);
        let listener = RelayListener::bind(&addr, routes)?.with_poll_interval(poll_interval);
        listener.serve()
    }
}
