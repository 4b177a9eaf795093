use std::io::{self, ErrorKind, Write};
use std::net::Shutdown;
use std::time::{Duration, Instant};

use log::{debug, info};
use ssh2::Session;

use super::connector::{dial_tcp, Connector, Upstream, CONNECT_TIMEOUT};
use crate::error::{Result, TunnelError};
use crate::protocol::Destination;

/// Session I/O slice. Reads give the session lock back this often so the
/// writing direction is not starved.
const IO_SLICE_MS: u32 = 100;

/// Opens an interactive shell with a pseudo-terminal over SSH instead of a
/// raw stream. The destination names the SSH server.
#[derive(Clone)]
pub struct ShellConnector {
    user: String,
    password: String,
    term: String,
    cols: u32,
    rows: u32,
    timeout: Duration,
}

impl ShellConnector {
    pub fn new(user: &str, password: &str) -> Self {
        ShellConnector {
            user: user.to_owned(),
            password: password.to_owned(),
            term: String::from("xterm"),
            cols: 80,
            rows: 40,
            timeout: CONNECT_TIMEOUT,
        }
    }

    pub fn with_term(mut self, term: &str, cols: u32, rows: u32) -> Self {
        self.term = term.to_owned();
        self.cols = cols;
        self.rows = rows;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl std::fmt::Debug for ShellConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShellConnector")
            .field("user", &self.user)
            .field("term", &self.term)
            .field("cols", &self.cols)
            .field("rows", &self.rows)
            .finish()
    }
}

impl Connector for ShellConnector {
    fn connect(&self, destination: &Destination) -> Result<Upstream> {
        let address = destination.address.as_str();
        let ssh_err = |e: ssh2::Error| TunnelError::dial_failed(address, e);

        let tcp = dial_tcp(&destination.network, address, self.timeout)?;
        let tcp_ctl = tcp.try_clone()?;

        let mut session = Session::new().map_err(ssh_err)?;
        session.set_timeout(self.timeout.as_millis().min(u32::MAX as u128) as u32);
        session.set_tcp_stream(tcp);
        session.handshake().map_err(ssh_err)?;
        session.userauth_password(&self.user, &self.password).map_err(ssh_err)?;

        let mut channel = session.channel_session().map_err(ssh_err)?;
        channel
            .request_pty(&self.term, None, Some((self.cols, self.rows, 0, 0)))
            .map_err(ssh_err)?;
        channel.shell().map_err(ssh_err)?;
        session.set_timeout(IO_SLICE_MS);
        info!("shell session started on {} as {}", address, self.user);

        let reader = channel.stream(0);
        let writer = PatientWriter::new(channel.stream(0), self.timeout);
        Ok(Upstream::new(reader, writer, move || {
            if let Err(e) = channel.send_eof().and_then(|_| channel.close()) {
                debug!("shell close: {}", e);
            }
            let _ = tcp_ctl.shutdown(Shutdown::Both);
            drop(session);
        }))
    }
}

/// Retries writes that hit the short session timeout, up to `patience`
/// per call.
pub struct PatientWriter<W> {
    inner: W,
    patience: Duration,
}

impl<W: Write> PatientWriter<W> {
    pub fn new(inner: W, patience: Duration) -> Self {
        PatientWriter { inner, patience }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

fn is_slice_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
}

impl<W: Write> Write for PatientWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let give_up = Instant::now() + self.patience;
        loop {
            match self.inner.write(buf) {
                Err(e) if is_slice_timeout(&e) && Instant::now() < give_up => continue,
                ret => return ret,
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        let give_up = Instant::now() + self.patience;
        loop {
            match self.inner.flush() {
                Err(e) if is_slice_timeout(&e) && Instant::now() < give_up => continue,
                ret => return ret,
            }
        }
    }
}
