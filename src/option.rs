use std::fs;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TunnelError};
use crate::secure::TlsMaterial;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "camelCase")]
pub enum BootOption {
    Relay(RelayOption),
    Client(ClientOption),
    Hello(HelloOption),
}

impl BootOption {
    pub fn log_level(&self) -> &str {
        match self {
            BootOption::Relay(opts) => &opts.log_level,
            BootOption::Client(opts) => &opts.log_level,
            BootOption::Hello(opts) => &opts.log_level,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayOption {
    #[serde(default = "listen_addr_default")]
    pub listen_addr: String,
    #[serde(default = "relay_port_default")]
    pub listen_port: u16,
    #[serde(default = "loglevel_default")]
    pub log_level: String,
    #[serde(default = "poll_interval_default")]
    pub poll_interval_ms: u64,
    #[serde(default = "timeout_default")]
    pub dial_timeout_secs: u64,
    #[serde(default = "routes_default")]
    pub routes: Vec<RouteOpts>,
}

impl RelayOption {
    /// Socket poll interval. Zero is rejected, sockets cannot time out
    /// after no time at all.
    pub fn poll_interval(&self) -> Result<Duration> {
        if self.poll_interval_ms == 0 {
            return Err(TunnelError::Config(String::from("pollIntervalMs must be at least 1")));
        }
        Ok(Duration::from_millis(self.poll_interval_ms))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum RouteOpts {
    Tunnel(TunnelRouteOpts),
    Forward(ForwardRouteOpts),
    Shell(ShellRouteOpts),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelRouteOpts {
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardRouteOpts {
    pub path: String,
    #[serde(default = "network_default")]
    pub network: String,
    pub address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShellRouteOpts {
    pub path: String,
    #[serde(default = "network_default")]
    pub network: String,
    pub address: String,
    pub user: String,
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
    /// Name of an environment variable holding the password.
    #[serde(default)]
    pub password_env: Option<String>,
    #[serde(default = "term_default")]
    pub term: String,
    #[serde(default = "cols_default")]
    pub cols: u32,
    #[serde(default = "rows_default")]
    pub rows: u32,
}

impl ShellRouteOpts {
    /// The inline password, else the one named by `passwordEnv`.
    pub fn resolve_password(&self) -> Result<String> {
        if let Some(password) = &self.password {
            return Ok(password.clone());
        }
        match &self.password_env {
            Some(name) => std::env::var(name)
                .map_err(|e| TunnelError::Config(format!("route {}: password env {}: {}", self.path, name, e))),
            None => Err(TunnelError::Config(format!(
                "route {}: either password or passwordEnv is required",
                self.path
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientOption {
    pub relay_url: String,
    #[serde(default = "network_default")]
    pub network: String,
    pub address: String,
    #[serde(default = "loglevel_default")]
    pub log_level: String,
    pub tls: Option<TlsOpts>,
    #[serde(default = "retries_default")]
    pub dial_retries: usize,
    #[serde(default = "timeout_default")]
    pub dial_timeout_secs: u64,
    #[serde(default = "timeout_default")]
    pub read_timeout_secs: u64,
    #[serde(default = "request_path_default")]
    pub request_path: String,
}

impl ClientOption {
    /// Host part of the destination address, used as TLS server name and
    /// HTTP host by default.
    pub fn host(&self) -> &str {
        match self.address.rsplit_once(':') {
            Some((host, _)) => host.trim_start_matches('[').trim_end_matches(']'),
            None => &self.address,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloOption {
    #[serde(default = "listen_addr_default")]
    pub listen_addr: String,
    #[serde(default = "hello_port_default")]
    pub listen_port: u16,
    #[serde(default = "loglevel_default")]
    pub log_level: String,
    pub tls: TlsOpts,
}

/// Certificate files of one TLS endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsOpts {
    /// Trust bundles merged into one pool, e.g. root and intermediate CAs.
    pub ca_files: Vec<String>,
    pub cert_file: String,
    pub key_file: String,
    pub server_name: Option<String>,
}

fn read_pem(path: &str) -> Result<Vec<u8>> {
    fs::read(path).map_err(|e| TunnelError::InvalidMaterial(format!("{}: {}", path, e)))
}

impl TlsOpts {
    pub fn load(&self) -> Result<TlsMaterial> {
        let mut anchors = Vec::with_capacity(self.ca_files.len());
        for path in &self.ca_files {
            anchors.push(read_pem(path)?);
        }
        Ok(TlsMaterial::new(anchors, read_pem(&self.cert_file)?, read_pem(&self.key_file)?))
    }
}

fn loglevel_default() -> String {
    String::from("info")
}

fn listen_addr_default() -> String {
    String::from("127.0.0.1")
}

fn relay_port_default() -> u16 {
    8080
}

fn hello_port_default() -> u16 {
    8443
}

fn poll_interval_default() -> u64 {
    20
}

fn timeout_default() -> u64 {
    10
}

fn retries_default() -> usize {
    3
}

fn network_default() -> String {
    String::from("tcp")
}

fn term_default() -> String {
    String::from("xterm")
}

fn cols_default() -> u32 {
    80
}

fn rows_default() -> u32 {
    40
}

fn request_path_default() -> String {
    String::from("/")
}

fn routes_default() -> Vec<RouteOpts> {
    vec![RouteOpts::Tunnel(TunnelRouteOpts {
        path: String::from("/ws"),
    })]
}
