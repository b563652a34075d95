//! Relay configuration.

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::crypto::CipherKind;
use crate::error::{Error, Result};

/// Which end of the tunnel a relay instance serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Client-facing SOCKS5 endpoint; upstream is the remote relay server
    Local,
    /// Tunnel endpoint; upstream is the final destination
    Server,
}

/// Runtime relay configuration.
#[derive(Clone)]
pub struct RelayConfig {
    /// Local or server side of the tunnel
    pub mode: Mode,
    /// SOCKS5 bind address (local mode)
    pub local_addr: String,
    /// SOCKS5 bind port (local mode)
    pub local_port: u16,
    /// Remote server host (local mode) or bind address (server mode)
    pub server: String,
    /// Remote server port (local mode) or bind port (server mode)
    pub server_port: u16,
    /// Shared tunnel password
    pub password: String,
    /// Cipher method name
    pub method: String,
    /// Idle timeout for TCP and UDP sessions
    pub timeout: Duration,
    /// Pending outbound bytes above which the source is paused
    pub high_water: usize,
    /// Pending outbound bytes below which the source is resumed
    pub low_water: usize,
    /// Run the UDP relay alongside TCP
    pub udp_enabled: bool,
    /// Upstream DNS servers; empty means resolv.conf, then public defaults
    pub dns_servers: Vec<SocketAddr>,
    /// Time to wait for one DNS reply before retrying
    pub dns_timeout: Duration,
    /// Queries sent to each DNS server before moving to the next
    pub dns_retries: u32,
    /// Query AAAA before A
    pub prefer_ipv6: bool,
    /// How long `stop` lets sessions drain before force-closing them
    pub grace_period: Duration,
    /// Cap on concurrent TCP sessions
    pub max_connections: usize,
    /// Per-client cap on datagrams waiting for name resolution
    pub udp_queue_limit: usize,
    /// Static host entries file
    pub hosts_path: Option<PathBuf>,
    /// Nameserver list file
    pub resolv_conf_path: Option<PathBuf>,
}

impl RelayConfig {
    /// Configuration for the client-facing side of the tunnel.
    pub fn local(
        server: impl Into<String>,
        server_port: u16,
        password: impl Into<String>,
        method: impl Into<String>,
    ) -> Self {
        Self {
            mode: Mode::Local,
            server: server.into(),
            server_port,
            password: password.into(),
            method: method.into(),
            ..Self::base()
        }
    }

    /// Configuration for the remote side of the tunnel, listening on
    /// `bind_addr:port`.
    pub fn server(
        bind_addr: impl Into<String>,
        port: u16,
        password: impl Into<String>,
        method: impl Into<String>,
    ) -> Self {
        Self {
            mode: Mode::Server,
            server: bind_addr.into(),
            server_port: port,
            password: password.into(),
            method: method.into(),
            ..Self::base()
        }
    }

    fn base() -> Self {
        Self {
            mode: Mode::Local,
            local_addr: "127.0.0.1".into(),
            local_port: 1080,
            server: String::new(),
            server_port: 8388,
            password: String::new(),
            method: default_method(),
            timeout: Duration::from_secs(300),
            high_water: 256 * 1024,
            low_water: 64 * 1024,
            udp_enabled: true,
            dns_servers: Vec::new(),
            dns_timeout: Duration::from_secs(2),
            dns_retries: 2,
            prefer_ipv6: false,
            grace_period: Duration::from_secs(10),
            max_connections: 4096,
            udp_queue_limit: 64,
            hosts_path: Some(PathBuf::from("/etc/hosts")),
            resolv_conf_path: Some(PathBuf::from("/etc/resolv.conf")),
        }
    }

    /// Parsed cipher method.
    pub fn cipher(&self) -> Result<CipherKind> {
        self.method.parse()
    }

    /// Address the TCP and UDP listeners bind to.
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        let (host, port) = match self.mode {
            Mode::Local => (&self.local_addr, self.local_port),
            Mode::Server => (&self.server, self.server_port),
        };
        let ip: IpAddr = host
            .parse()
            .map_err(|_| Error::config(format!("bind address must be an IP literal: {}", host)))?;
        Ok(SocketAddr::new(ip, port))
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.password.is_empty() {
            return Err(Error::config("password cannot be empty"));
        }
        self.cipher()?;
        self.listen_addr()?;
        if self.mode == Mode::Local {
            if self.server.is_empty() {
                return Err(Error::config("server cannot be empty"));
            }
            if self.server_port == 0 {
                return Err(Error::config("server_port cannot be zero"));
            }
        }
        if self.timeout.is_zero() {
            return Err(Error::config("timeout cannot be zero"));
        }
        if self.low_water >= self.high_water {
            return Err(Error::config(format!(
                "low_water ({}) must be below high_water ({})",
                self.low_water, self.high_water
            )));
        }
        if self.dns_timeout.is_zero() {
            return Err(Error::config("dns_timeout cannot be zero"));
        }
        if self.max_connections == 0 {
            return Err(Error::config("max_connections cannot be zero"));
        }
        if self.udp_queue_limit == 0 {
            return Err(Error::config("udp_queue_limit cannot be zero"));
        }
        Ok(())
    }
}

impl std::fmt::Debug for RelayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayConfig")
            .field("mode", &self.mode)
            .field("local_addr", &self.local_addr)
            .field("local_port", &self.local_port)
            .field("server", &self.server)
            .field("server_port", &self.server_port)
            .field("method", &self.method)
            .field("timeout", &self.timeout)
            .field("udp_enabled", &self.udp_enabled)
            .finish_non_exhaustive()
    }
}

fn default_local_address() -> String {
    "127.0.0.1".into()
}

fn default_local_port() -> u16 {
    1080
}

fn default_method() -> String {
    "aes-256-gcm".into()
}

fn default_timeout() -> u64 {
    300
}

fn default_true() -> bool {
    true
}

/// Configuration file format (shadowsocks-style JSON).
#[derive(Debug, Serialize, Deserialize)]
pub struct RelayConfigFile {
    /// Remote server host, or bind address when running as the server
    pub server: String,
    /// Remote server port, or bind port when running as the server
    pub server_port: u16,
    /// SOCKS5 bind address
    #[serde(default = "default_local_address")]
    pub local_address: String,
    /// SOCKS5 bind port
    #[serde(default = "default_local_port")]
    pub local_port: u16,
    /// Shared password
    pub password: String,
    /// Cipher method
    #[serde(default = "default_method")]
    pub method: String,
    /// Idle timeout (seconds)
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    /// Enable the UDP relay
    #[serde(default = "default_true")]
    pub udp: bool,
    /// DNS servers as `ip` or `ip:port`
    #[serde(default)]
    pub dns_servers: Vec<String>,
    /// DNS reply timeout (seconds)
    #[serde(default)]
    pub dns_timeout: Option<u64>,
    /// Queries per DNS server
    #[serde(default)]
    pub dns_retries: Option<u32>,
    /// Prefer IPv6 answers
    #[serde(default)]
    pub prefer_ipv6: bool,
    /// Backpressure high-water mark (bytes)
    #[serde(default)]
    pub high_water: Option<usize>,
    /// Backpressure low-water mark (bytes)
    #[serde(default)]
    pub low_water: Option<usize>,
    /// Shutdown grace period (seconds)
    #[serde(default)]
    pub grace_period: Option<u64>,
    /// Concurrent TCP session cap
    #[serde(default)]
    pub max_connections: Option<usize>,
    /// Datagrams held per UDP client while its target resolves
    #[serde(default)]
    pub udp_queue_limit: Option<usize>,
    /// Static hosts file; an empty string disables it
    #[serde(default)]
    pub hosts_path: Option<PathBuf>,
    /// Nameserver source used when `dns_servers` is empty; an empty string disables it
    #[serde(default)]
    pub resolv_conf_path: Option<PathBuf>,
}

impl RelayConfigFile {
    /// Parse a JSON configuration document.
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| Error::config(format!("invalid config: {}", e)))
    }

    /// Convert to runtime configuration for the given side of the tunnel.
    pub fn to_config(&self, mode: Mode) -> Result<RelayConfig> {
        let mut config = match mode {
            Mode::Local => RelayConfig::local(
                self.server.clone(),
                self.server_port,
                self.password.clone(),
                self.method.clone(),
            ),
            Mode::Server => RelayConfig::server(
                self.server.clone(),
                self.server_port,
                self.password.clone(),
                self.method.clone(),
            ),
        };

        config.local_addr = self.local_address.clone();
        config.local_port = self.local_port;
        config.timeout = Duration::from_secs(self.timeout);
        config.udp_enabled = self.udp;
        config.prefer_ipv6 = self.prefer_ipv6;
        config.dns_servers = self
            .dns_servers
            .iter()
            .map(|s| parse_dns_server(s))
            .collect::<Result<_>>()?;

        if let Some(secs) = self.dns_timeout {
            config.dns_timeout = Duration::from_secs(secs);
        }
        if let Some(retries) = self.dns_retries {
            config.dns_retries = retries;
        }
        if let Some(high) = self.high_water {
            config.high_water = high;
        }
        if let Some(low) = self.low_water {
            config.low_water = low;
        }
        if let Some(secs) = self.grace_period {
            config.grace_period = Duration::from_secs(secs);
        }
        if let Some(max) = self.max_connections {
            config.max_connections = max;
        }
        if let Some(limit) = self.udp_queue_limit {
            config.udp_queue_limit = limit;
        }
        if let Some(path) = &self.hosts_path {
            config.hosts_path = non_empty(path);
        }
        if let Some(path) = &self.resolv_conf_path {
            config.resolv_conf_path = non_empty(path);
        }

        config.validate()?;
        Ok(config)
    }
}

fn non_empty(path: &Path) -> Option<PathBuf> {
    (!path.as_os_str().is_empty()).then(|| path.to_path_buf())
}

/// Parse `ip` or `ip:port` (`[v6]:port` for IPv6), defaulting to port 53.
pub fn parse_dns_server(s: &str) -> Result<SocketAddr> {
    if let Ok(addr) = s.parse::<SocketAddr>() {
        return Ok(addr);
    }
    s.parse::<IpAddr>()
        .map(|ip| SocketAddr::new(ip, 53))
        .map_err(|_| Error::config(format!("invalid DNS server: {}", s)))
}
