//! Proxy list parsing for imports

use crate::proxy::models::{Proxy, Protocol};
use crate::Result;
use anyhow::Context;
use once_cell::sync::Lazy;
use regex::Regex;
use std::fs;
use std::path::Path;

static URL_FORMAT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(https?|socks[45])://(?:([^:@]+):([^@]+)@)?([^:/@]+):(\d{1,5})/?$")
        .expect("Invalid proxy URL regex")
});

static AUTH_AT_FORMAT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([^:@]+):([^@]+)@([^:@]+):(\d{1,5})$").expect("Invalid user:pass@host regex")
});

/// Parser for proxy lists in the common text formats
pub struct ProxyParser;

impl ProxyParser {
    /// Parse a single proxy line
    ///
    /// Supports formats:
    /// - IP:PORT
    /// - IP:PORT:USER:PASS
    /// - USER:PASS@IP:PORT
    /// - scheme://IP:PORT
    /// - scheme://USER:PASS@IP:PORT
    pub fn parse_line(line: &str, default_protocol: Protocol) -> Option<Proxy> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return None;
        }

        if let Some(caps) = URL_FORMAT.captures(line) {
            let protocol = caps[1].parse::<Protocol>().ok()?;
            let port = parse_port(&caps[5])?;
            let host = caps[4].to_string();
            return Some(match (caps.get(2), caps.get(3)) {
                (Some(user), Some(pass)) => Proxy::with_auth(
                    host,
                    port,
                    protocol,
                    user.as_str().to_string(),
                    pass.as_str().to_string(),
                ),
                _ => Proxy::new(host, port, protocol),
            });
        }

        if let Some(caps) = AUTH_AT_FORMAT.captures(line) {
            let port = parse_port(&caps[4])?;
            return Some(Proxy::with_auth(
                caps[3].to_string(),
                port,
                default_protocol,
                caps[1].to_string(),
                caps[2].to_string(),
            ));
        }

        let parts: Vec<&str> = line.split(':').collect();
        match parts.as_slice() {
            [host, port] if !host.is_empty() => {
                Some(Proxy::new(host.to_string(), parse_port(port)?, default_protocol))
            }
            [host, port, user, pass] if !host.is_empty() => Some(Proxy::with_auth(
                host.to_string(),
                parse_port(port)?,
                default_protocol,
                user.to_string(),
                pass.to_string(),
            )),
            _ => None,
        }
    }

    /// Parse proxies from multi-line content, dropping duplicates by identity hash
    pub fn parse_string(content: &str, default_protocol: Protocol) -> Vec<Proxy> {
        let mut seen = std::collections::HashSet::new();
        content
            .lines()
            .filter_map(|line| Self::parse_line(line, default_protocol))
            .filter(|proxy| seen.insert(proxy.hash()))
            .collect()
    }

    pub fn parse_file<P: AsRef<Path>>(path: P, default_protocol: Protocol) -> Result<Vec<Proxy>> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading proxy list {}", path.display()))?;
        Ok(Self::parse_string(&content, default_protocol))
    }

    /// Save proxies to a file, one per line
    pub fn save_to_file<P: AsRef<Path>>(proxies: &[Proxy], path: P) -> Result<()> {
        let content = proxies
            .iter()
            .map(Proxy::to_full_string)
            .collect::<Vec<_>>()
            .join("\n");
        fs::write(path, content)?;
        Ok(())
    }
}

fn parse_port(s: &str) -> Option<u16> {
    match s.parse::<u16>() {
        Ok(0) | Err(_) => None,
        Ok(port) => Some(port),
    }
}
