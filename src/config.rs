use std::{fmt, net::SocketAddr, path::PathBuf, str::FromStr, time::Duration};

use thiserror::Error;

use crate::http11::DEFAULT_MAX_HEADER_SIZE;
use crate::protocol::constants::{DEFAULT_PACKET_SIZE, MAX_PACKET_SIZE};

pub const DEFAULT_LISTEN: &str = "127.0.0.1:8009";
pub const DEFAULT_MAX_THREADS: usize = 15;
pub const DEFAULT_MAX_POOLED: usize = 64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("packet size {0} is outside 8192..=65536")]
    PacketSize(usize),
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("invalid listen address {0:?}")]
    ListenAddress(String),
    #[error("unknown protocol {0:?}, expected ajp13 or http11")]
    Protocol(String),
}

/// Where the connector accepts connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenAddress {
    Tcp(SocketAddr),
    Unix(PathBuf),
}

impl FromStr for ListenAddress {
    type Err = ConfigError;

    /// Accepts `host:port` or `unix:/path/to.sock`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(path) = s.strip_prefix("unix:") {
            if path.is_empty() {
                return Err(ConfigError::ListenAddress(s.to_owned()));
            }
            return Ok(Self::Unix(PathBuf::from(path)));
        }
        s.parse()
            .map(Self::Tcp)
            .map_err(|_| ConfigError::ListenAddress(s.to_owned()))
    }
}

impl fmt::Display for ListenAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(addr) => write!(f, "{addr}"),
            Self::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

/// Wire protocol spoken on accepted connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProtocolKind {
    #[default]
    Ajp13,
    Http11,
}

impl FromStr for ProtocolKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ajp13" | "ajp" => Ok(Self::Ajp13),
            "http11" | "http" | "http/1.1" => Ok(Self::Http11),
            _ => Err(ConfigError::Protocol(s.to_owned())),
        }
    }
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ajp13 => "ajp13",
            Self::Http11 => "http11",
        })
    }
}

/// Everything a [`Connector`](crate::server::Connector) needs to start.
#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    pub listen: ListenAddress,
    pub protocol: ProtocolKind,
    /// Worker threads, hence concurrently served connections.
    pub max_threads: usize,
    pub max_pooled_exchanges: usize,
    pub max_pooled_buffers: usize,
    /// Largest AJP packet, header included.
    pub packet_size: usize,
    /// Largest HTTP/1.1 request head.
    pub max_header_size: usize,
    /// Idle limit on a connection read; `None` blocks forever.
    pub read_timeout: Option<Duration>,
    /// Shared secret the front end must present in every forward request.
    pub required_secret: Option<String>,
    /// Accept the remote user and auth type the front end asserts.
    pub trust_front_end_auth: bool,
    /// Value for the HTTP/1.1 `Server` response header.
    pub server_header: Option<String>,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            listen: ListenAddress::Tcp(SocketAddr::from(([127, 0, 0, 1], 8009))),
            protocol: ProtocolKind::default(),
            max_threads: DEFAULT_MAX_THREADS,
            max_pooled_exchanges: DEFAULT_MAX_POOLED,
            max_pooled_buffers: DEFAULT_MAX_POOLED,
            packet_size: DEFAULT_PACKET_SIZE,
            max_header_size: DEFAULT_MAX_HEADER_SIZE,
            read_timeout: None,
            required_secret: None,
            trust_front_end_auth: true,
            server_header: None,
        }
    }
}

impl ConnectorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(DEFAULT_PACKET_SIZE..=MAX_PACKET_SIZE).contains(&self.packet_size) {
            return Err(ConfigError::PacketSize(self.packet_size));
        }
        let counts = [
            ("max_threads", self.max_threads),
            ("max_pooled_exchanges", self.max_pooled_exchanges),
            ("max_pooled_buffers", self.max_pooled_buffers),
            ("max_header_size", self.max_header_size),
        ];
        for (name, value) in counts {
            if value == 0 {
                return Err(ConfigError::Zero(name));
            }
        }
        Ok(())
    }
}
