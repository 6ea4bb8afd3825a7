//! Upstream ("actual") proxy resolution.

use std::fmt;

/// A host/port pair to connect to. The host is a name or an IP literal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DnsEndpoint {
    pub host: String,
    pub port: u16,
}

impl DnsEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse `host:port` or `[v6]:port`.
    pub fn parse(value: &str) -> Option<Self> {
        let (host, port) = split_host_port(value.trim())?;
        Some(Self::new(host, port?))
    }

    pub fn matches(&self, host: &str, port: u16) -> bool {
        self.port == port && self.host.eq_ignore_ascii_case(host)
    }
}

impl fmt::Display for DnsEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Split `host[:port]`, unwrapping bracketed IPv6 hosts.
///
/// Returns `None` when the value is malformed; the port is `None` when absent.
pub(crate) fn split_host_port(value: &str) -> Option<(&str, Option<u16>)> {
    if let Some(rest) = value.strip_prefix('[') {
        let close = rest.find(']')?;
        let host = &rest[..close];
        let after = &rest[close + 1..];
        if after.is_empty() {
            return Some((host, None));
        }
        let port = after.strip_prefix(':')?.parse().ok()?;
        return Some((host, Some(port)));
    }

    match value.rsplit_once(':') {
        // A bare IPv6 literal without brackets cannot carry a port.
        Some((host, _)) if host.contains(':') => Some((value, None)),
        Some((host, port)) if !host.is_empty() => Some((host, Some(port.parse().ok()?))),
        Some(_) => None,
        None if value.is_empty() => None,
        None => Some((value, None)),
    }
}

/// What a request wants to reach.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestTarget {
    pub host: String,
    pub port: u16,
    /// Absolute request URI; `None` for CONNECT (authority form).
    pub uri: Option<String>,
}

impl RequestTarget {
    pub fn endpoint(&self) -> DnsEndpoint {
        DnsEndpoint::new(self.host.clone(), self.port)
    }
}

impl fmt::Display for RequestTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.uri {
            Some(uri) => f.write_str(uri),
            None => write!(f, "{}", self.endpoint()),
        }
    }
}

/// Decides which upstream proxies a request goes through.
pub trait UpstreamResolver: Send + Sync {
    /// Ordered candidates; `None` or empty means connect directly to the target.
    fn get_proxy_endpoints(&self, target: &RequestTarget) -> Option<Vec<DnsEndpoint>>;
}

/// Always the same upstream proxies, except for bypassed hosts.
///
/// Bypass patterns: an exact host, `*.suffix`, or `<local>` for dotless hosts.
#[derive(Debug, Clone)]
pub struct StaticResolver {
    endpoints: Vec<DnsEndpoint>,
    bypass: Vec<String>,
}

impl StaticResolver {
    pub fn new(endpoints: Vec<DnsEndpoint>, bypass: Vec<String>) -> Self {
        Self {
            endpoints,
            bypass: bypass.into_iter().map(|p| p.to_ascii_lowercase()).collect(),
        }
    }

    pub fn endpoints(&self) -> &[DnsEndpoint] {
        &self.endpoints
    }

    pub fn is_bypassed(&self, host: &str) -> bool {
        let host = host.to_ascii_lowercase();
        self.bypass.iter().any(|pattern| {
            if pattern == "<local>" {
                !host.contains('.') && !host.contains(':')
            } else if let Some(suffix) = pattern.strip_prefix("*.") {
                host.strip_suffix(suffix)
                    .is_some_and(|prefix| prefix.ends_with('.'))
            } else {
                *pattern == host
            }
        })
    }
}

impl UpstreamResolver for StaticResolver {
    fn get_proxy_endpoints(&self, target: &RequestTarget) -> Option<Vec<DnsEndpoint>> {
        if self.endpoints.is_empty() || self.is_bypassed(&target.host) {
            return None;
        }
        Some(self.endpoints.clone())
    }
}
