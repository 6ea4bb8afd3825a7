//! Listener endpoint grammar and metrics configuration.
//!
//! Grammar: `entry (';' entry)*` where `entry = host ':' port (',' key '=' value)*`.
//! IPv6 hosts are written in brackets. The only parameter is `backlog`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};

pub const DEFAULT_BACKLOG: u32 = 128;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EndpointParseError {
    #[error("listener endpoint list is empty")]
    Empty,
    #[error("missing port in listener endpoint '{0}'")]
    MissingPort(String),
    #[error("invalid port in listener endpoint '{0}'")]
    InvalidPort(String),
    #[error("unterminated '[' in listener endpoint '{0}'")]
    UnterminatedBracket(String),
    #[error("cannot resolve listener host '{0}'")]
    InvalidHost(String),
    #[error("invalid backlog '{0}'")]
    InvalidBacklog(String),
    #[error("unknown listener parameter '{0}'")]
    UnknownParameter(String),
}

/// Where and how a listener binds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerSettings {
    pub endpoint: SocketAddr,
    pub backlog: u32,
}

impl ListenerSettings {
    pub fn new(endpoint: SocketAddr) -> Self {
        Self {
            endpoint,
            backlog: DEFAULT_BACKLOG,
        }
    }

    /// Parse a `;`-separated list of listener endpoints.
    pub fn parse_list(value: &str) -> Result<Vec<Self>, EndpointParseError> {
        let list = value
            .split(';')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(Self::parse)
            .collect::<Result<Vec<_>, _>>()?;
        if list.is_empty() {
            return Err(EndpointParseError::Empty);
        }
        Ok(list)
    }

    /// Parse a single `host:port[,backlog=N]` entry.
    pub fn parse(entry: &str) -> Result<Self, EndpointParseError> {
        let mut parts = entry.trim().split(',');
        let address = parts.next().unwrap_or_default().trim();
        let mut settings = Self::new(parse_address(address)?);

        for param in parts {
            let param = param.trim();
            let (key, value) = param
                .split_once('=')
                .ok_or_else(|| EndpointParseError::UnknownParameter(param.to_string()))?;
            match key.trim().to_ascii_lowercase().as_str() {
                "backlog" => {
                    settings.backlog = value
                        .trim()
                        .parse()
                        .ok()
                        .filter(|b| *b > 0)
                        .ok_or_else(|| EndpointParseError::InvalidBacklog(value.to_string()))?;
                }
                _ => return Err(EndpointParseError::UnknownParameter(key.to_string())),
            }
        }
        Ok(settings)
    }
}

impl fmt::Display for ListenerSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},backlog={}", self.endpoint, self.backlog)
    }
}

fn parse_address(address: &str) -> Result<SocketAddr, EndpointParseError> {
    let (host, port) = if let Some(rest) = address.strip_prefix('[') {
        let (host, after) = rest
            .split_once(']')
            .ok_or_else(|| EndpointParseError::UnterminatedBracket(address.to_string()))?;
        let port = after
            .strip_prefix(':')
            .ok_or_else(|| EndpointParseError::MissingPort(address.to_string()))?;
        (host, port)
    } else {
        address
            .rsplit_once(':')
            .filter(|(host, _)| !host.contains(':'))
            .ok_or_else(|| EndpointParseError::MissingPort(address.to_string()))?
    };

    let port: u16 = port
        .parse()
        .map_err(|_| EndpointParseError::InvalidPort(address.to_string()))?;

    let ip = match host {
        "" | "*" => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        h if h.eq_ignore_ascii_case("localhost") => IpAddr::V4(Ipv4Addr::LOCALHOST),
        h => match h.parse::<IpAddr>() {
            Ok(ip) => ip,
            Err(_) => (h, port)
                .to_socket_addrs()
                .ok()
                .and_then(|mut addrs| addrs.next())
                .map(|addr| addr.ip())
                .ok_or_else(|| EndpointParseError::InvalidHost(h.to_string()))?,
        },
    };
    Ok(SocketAddr::new(ip, port))
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            port: default_metrics_port(),
        }
    }
}
