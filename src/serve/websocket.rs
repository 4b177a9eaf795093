use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, info, warn};
use tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tungstenite::http::StatusCode;
use tungstenite::protocol::Role;
use tungstenite::HandshakeError;

use crate::cancel::CancelToken;
use crate::error::Result;
use crate::protocol::Destination;
use crate::relay::{Connector, RelaySession};
#[cfg(feature = "shell")]
use crate::relay::ShellConnector;
use crate::transport::{Wire, WsSocket, POLL_INTERVAL};
use crate::utils::uuid::get_uuidv4;

/// Bound on the upgrade exchange, so a silent client cannot pin a thread.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Where a route takes the destination of a session from.
#[derive(Debug, Clone)]
pub enum DestinationSource {
    /// `network` and `address` query parameters of the upgrade request.
    Query,
    /// A fixed destination, the query is ignored.
    Fixed(Destination),
}

/// A request path served by the relay.
#[derive(Clone)]
pub struct Route {
    pub path: String,
    pub source: DestinationSource,
    pub connector: Arc<dyn Connector>,
    pub forward_text: bool,
}

impl Route {
    pub fn tunnel(path: &str, connector: Arc<dyn Connector>) -> Self {
        Route {
            path: path.to_owned(),
            source: DestinationSource::Query,
            connector,
            forward_text: false,
        }
    }

    pub fn forward(path: &str, destination: Destination, connector: Arc<dyn Connector>) -> Self {
        Route {
            path: path.to_owned(),
            source: DestinationSource::Fixed(destination),
            connector,
            forward_text: false,
        }
    }

    /// Terminal input may arrive as text messages, so they are forwarded.
    #[cfg(feature = "shell")]
    pub fn shell(path: &str, destination: Destination, connector: ShellConnector) -> Self {
        Route {
            path: path.to_owned(),
            source: DestinationSource::Fixed(destination),
            connector: Arc::new(connector),
            forward_text: true,
        }
    }
}

fn reject(status: StatusCode, reason: &str) -> ErrorResponse {
    let mut resp = ErrorResponse::new(Some(reason.to_owned()));
    *resp.status_mut() = status;
    resp
}

fn select_route(routes: &[Arc<Route>], req: &Request) -> std::result::Result<(Arc<Route>, Destination), ErrorResponse> {
    let path = req.uri().path();
    let route = match routes.iter().find(|r| r.path == path) {
        Some(route) => route.clone(),
        None => return Err(reject(StatusCode::NOT_FOUND, "not found")),
    };
    let destination = match &route.source {
        DestinationSource::Query => {
            Destination::from_query(req.uri().query()).map_err(|e| reject(StatusCode::BAD_REQUEST, &e.to_string()))?
        }
        DestinationSource::Fixed(destination) => destination.clone(),
    };
    Ok((route, destination))
}

/// Accepts WebSocket channels and relays each one to its destination on a
/// thread of its own.
pub struct RelayListener {
    listener: TcpListener,
    routes: Vec<Arc<Route>>,
    poll_interval: Duration,
    token: CancelToken,
}

impl RelayListener {
    pub fn bind(addr: &str, routes: Vec<Route>) -> Result<Self> {
        let listener = TcpListener::bind(addr)?;
        Ok(RelayListener {
            listener,
            routes: routes.into_iter().map(Arc::new).collect(),
            poll_interval: POLL_INTERVAL,
            token: CancelToken::new(),
        })
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn get_addr(&self) -> String {
        match self.listener.local_addr() {
            Ok(addr) => format!("ws://{}", addr),
            Err(_) => String::from("ws://<unbound>"),
        }
    }

    /// Cancelling this token stops the accept loop and every live session.
    pub fn token(&self) -> CancelToken {
        self.token.clone()
    }

    /// Accepts until the token is cancelled.
    pub fn serve(self) -> Result<()> {
        let addr = self.listener.local_addr()?;
        // a throwaway connection wakes the blocked accept
        self.token.on_cancel(move || {
            let _ = TcpStream::connect(addr);
        });
        info!("relay listen on {}", self.get_addr());
        for conn in self.listener.incoming() {
            if self.token.is_cancelled() {
                break;
            }
            let stream = match conn {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("accept error: {}", e);
                    continue;
                }
            };
            let routes = self.routes.clone();
            let poll_interval = self.poll_interval;
            let token = self.token.child();
            thread::spawn(move || handle_connection(stream, &routes, poll_interval, token));
        }
        info!("relay on {} stopped", addr);
        Ok(())
    }

    /// Serves on a background thread.
    pub fn spawn(self) -> Result<JoinHandle<()>> {
        let handle = thread::Builder::new().name(String::from("relay listener")).spawn(move || {
            if let Err(e) = self.serve() {
                error!("relay listener: {}", e);
            }
        })?;
        Ok(handle)
    }
}

fn handle_connection(stream: TcpStream, routes: &[Arc<Route>], poll_interval: Duration, token: CancelToken) {
    let peer = match stream.peer_addr() {
        Ok(peer) => peer.to_string(),
        Err(_) => String::from("unknown"),
    };
    if let Err(e) = stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT)) {
        debug!("{}: set handshake timeout: {}", peer, e);
    }

    let mut selected = None;
    let ret = tungstenite::accept_hdr(Wire::new(stream), |req: &Request, resp: Response| {
        let (route, destination) = select_route(routes, req).map_err(|err| {
            info!("{} {} rejected: {}", peer, req.uri(), err.status());
            err
        })?;
        selected = Some((route, destination));
        Ok(resp)
    });
    let ws = match ret {
        Ok(ws) => ws,
        Err(HandshakeError::Failure(e)) => {
            debug!("{}: upgrade failed: {}", peer, e);
            return;
        }
        Err(HandshakeError::Interrupted(_)) => {
            debug!("{}: upgrade interrupted", peer);
            return;
        }
    };
    let Some((route, destination)) = selected else {
        return;
    };

    let socket = match WsSocket::new(ws, Role::Server, poll_interval) {
        Ok(socket) => Arc::new(socket),
        Err(e) => {
            error!("{}: {}", peer, e);
            return;
        }
    };
    let sid = get_uuidv4();
    debug!("[{}] channel from {} on {}", sid, peer, route.path);
    let session = RelaySession::new(&sid, destination, socket)
        .with_token(token)
        .with_forward_text(route.forward_text);
    if let Err(e) = session.run(route.connector.as_ref()) {
        debug!("[{}] session ended before relaying: {}", sid, e);
    }
}
