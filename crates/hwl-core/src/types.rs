//! Core domain types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::ConfigError;

/// Where an exporter listens or a client connects
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    /// TCP `host:port`
    Tcp(String),
    /// Unix domain socket path
    Unix(PathBuf),
}

impl Address {
    /// Whether this is a unix socket address
    pub fn is_unix(&self) -> bool {
        matches!(self, Address::Unix(_))
    }
}

impl FromStr for Address {
    type Err = ConfigError;

    /// Accepts `unix://<path>`, `tcp://<host:port>`, a bare absolute path, or
    /// a bare `host:port`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(path) = s.strip_prefix("unix://") {
            if path.is_empty() {
                return Err(ConfigError::Invalid(format!("empty unix socket path in '{}'", s)));
            }
            return Ok(Address::Unix(PathBuf::from(path)));
        }
        let tcp = s.strip_prefix("tcp://").unwrap_or(s);
        if tcp.starts_with('/') {
            return Ok(Address::Unix(PathBuf::from(tcp)));
        }
        HostPort::from_str(tcp)?;
        Ok(Address::Tcp(tcp.to_string()))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Tcp(addr) => write!(f, "tcp://{}", addr),
            Address::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

/// A `host:port` pair where the host may be a bracketed IPv6 literal
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HostPort {
    /// Host without brackets
    pub host: String,
    /// Port number
    pub port: u16,
}

impl HostPort {
    /// The host as an IP address, if it is one
    pub fn ip(&self) -> Option<IpAddr> {
        self.host.parse().ok()
    }
}

impl FromStr for HostPort {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::Invalid(format!("expected host:port, got '{}'", s));

        let (host, port) = if let Some(rest) = s.strip_prefix('[') {
            let (host, tail) = rest.split_once(']').ok_or_else(invalid)?;
            let port = tail.strip_prefix(':').ok_or_else(invalid)?;
            (host, port)
        } else {
            s.rsplit_once(':').ok_or_else(invalid)?
        };

        if host.is_empty() {
            return Err(invalid());
        }
        let port = port.parse::<u16>().map_err(|_| invalid())?;

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}
