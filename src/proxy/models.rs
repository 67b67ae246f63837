//! Proxy data models

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Protocol a proxy is checked over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Http,
    Https,
    Socks4,
    Socks5,
}

impl Protocol {
    pub const ALL: [Protocol; 4] = [
        Protocol::Http,
        Protocol::Https,
        Protocol::Socks4,
        Protocol::Socks5,
    ];

    pub fn is_socks(&self) -> bool {
        matches!(self, Protocol::Socks4 | Protocol::Socks5)
    }

    /// Protocol of the judge endpoint used when checking over `self`.
    ///
    /// SOCKS proxies tunnel arbitrary traffic, so they are probed against
    /// whichever judge scheme the user prefers.
    pub fn judge_protocol(&self, socks_preference: Protocol) -> Protocol {
        match self {
            Protocol::Http => Protocol::Http,
            Protocol::Https => Protocol::Https,
            Protocol::Socks4 | Protocol::Socks5 => match socks_preference {
                Protocol::Https => Protocol::Https,
                _ => Protocol::Http,
            },
        }
    }

    /// URL scheme used to reach the proxy itself.
    pub fn proxy_scheme(&self) -> &'static str {
        match self {
            Protocol::Http | Protocol::Https => "http",
            Protocol::Socks4 => "socks4",
            Protocol::Socks5 => "socks5",
        }
    }

    /// Parse a comma separated protocol list, skipping unknown entries.
    pub fn parse_list(s: &str) -> Vec<Protocol> {
        let mut out = Vec::new();
        for part in s.split(',') {
            if let Ok(p) = part.parse::<Protocol>() {
                if !out.contains(&p) {
                    out.push(p);
                }
            }
        }
        out
    }

    pub fn join_list(protocols: &[Protocol]) -> String {
        protocols
            .iter()
            .map(|p| p.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Http => write!(f, "http"),
            Protocol::Https => write!(f, "https"),
            Protocol::Socks4 => write!(f, "socks4"),
            Protocol::Socks5 => write!(f, "socks5"),
        }
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "http" => Ok(Protocol::Http),
            "https" => Ok(Protocol::Https),
            "socks4" => Ok(Protocol::Socks4),
            "socks5" => Ok(Protocol::Socks5),
            other => Err(format!(
                "Invalid protocol: {}. Use: http, https, socks4, socks5",
                other
            )),
        }
    }
}

/// Proxy authentication credentials
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyAuth {
    pub username: String,
    pub password: String,
}

impl ProxyAuth {
    pub fn new(username: String, password: String) -> Self {
        Self { username, password }
    }
}

/// Identity hash of a proxy: hex SHA-256 over ip, port and credentials.
pub fn content_hash(host: &str, port: u16, auth: Option<&ProxyAuth>) -> String {
    let (user, pass) = auth
        .map(|a| (a.username.as_str(), a.password.as_str()))
        .unwrap_or(("", ""));
    let mut hasher = Sha256::new();
    hasher.update(host.as_bytes());
    hasher.update(b"|");
    hasher.update(port.to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(user.as_bytes());
    hasher.update(b"|");
    hasher.update(pass.as_bytes());
    hex::encode(hasher.finalize())
}

/// A parsed proxy line, before it is stored
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proxy {
    pub host: String,
    pub port: u16,
    /// Protocol hint from the source line (scheme prefix), if any
    pub protocol: Protocol,
    pub auth: Option<ProxyAuth>,
}

impl Proxy {
    pub fn new(host: String, port: u16, protocol: Protocol) -> Self {
        Self {
            host,
            port,
            protocol,
            auth: None,
        }
    }

    pub fn with_auth(
        host: String,
        port: u16,
        protocol: Protocol,
        username: String,
        password: String,
    ) -> Self {
        Self {
            host,
            port,
            protocol,
            auth: Some(ProxyAuth::new(username, password)),
        }
    }

    pub fn hash(&self) -> String {
        content_hash(&self.host, self.port, self.auth.as_ref())
    }

    /// Get the proxy string with auth in IP:PORT:USER:PASS format
    pub fn to_full_string(&self) -> String {
        match &self.auth {
            Some(auth) => format!(
                "{}:{}:{}:{}",
                self.host, self.port, auth.username, auth.password
            ),
            None => format!("{}:{}", self.host, self.port),
        }
    }
}

/// A stored proxy plus the data the scheduling queue carries for it.
///
/// Serialized as the queue payload; `hash` is the due-index member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: i64,
    pub host: String,
    pub port: u16,
    pub auth: Option<ProxyAuth>,
    pub hash: String,
}

impl WorkItem {
    pub fn new(id: i64, host: String, port: u16, auth: Option<ProxyAuth>) -> Self {
        let hash = content_hash(&host, port, auth.as_ref());
        Self {
            id,
            host,
            port,
            auth,
            hash,
        }
    }

    pub fn from_proxy(id: i64, proxy: &Proxy) -> Self {
        Self::new(id, proxy.host.clone(), proxy.port, proxy.auth.clone())
    }

    /// URL used to route requests through this proxy over `protocol`
    pub fn proxy_url(&self, protocol: Protocol) -> String {
        let auth_part = self.auth.as_ref().map_or(String::new(), |auth| {
            format!("{}:{}@", auth.username, auth.password)
        });
        format!(
            "{}://{}{}:{}",
            protocol.proxy_scheme(),
            auth_part,
            self.host,
            self.port
        )
    }
}

impl fmt::Display for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Anonymity level derived from what a judge saw
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnonymityLevel {
    Transparent,
    Anonymous,
    Elite,
}

impl fmt::Display for AnonymityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnonymityLevel::Transparent => write!(f, "transparent"),
            AnonymityLevel::Anonymous => write!(f, "anonymous"),
            AnonymityLevel::Elite => write!(f, "elite"),
        }
    }
}

/// Result of one grouped check (one outbound request, possibly retried)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckOutcome {
    pub protocol: Protocol,
    pub judge_url: String,
    pub alive: bool,
    pub attempts: u32,
    pub latency_ms: Option<u64>,
    pub anonymity: Option<AnonymityLevel>,
    pub error: Option<String>,
}

impl CheckOutcome {
    pub fn working(
        protocol: Protocol,
        judge_url: String,
        attempts: u32,
        latency_ms: u64,
        anonymity: AnonymityLevel,
    ) -> Self {
        Self {
            protocol,
            judge_url,
            alive: true,
            attempts,
            latency_ms: Some(latency_ms),
            anonymity: Some(anonymity),
            error: None,
        }
    }

    pub fn failed(protocol: Protocol, judge_url: String, attempts: u32, error: String) -> Self {
        Self {
            protocol,
            judge_url,
            alive: false,
            attempts,
            latency_ms: None,
            anonymity: None,
            error: Some(error),
        }
    }
}

/// A user owning a proxy, with the per-user check settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyOwner {
    pub user_id: i64,
    pub timeout_ms: u64,
    pub retries: u32,
    pub auto_remove: bool,
    pub auto_remove_threshold: u32,
    pub protocols: Vec<Protocol>,
    pub socks_judge_protocol: Protocol,
}
