// src/core/types.rs

//! Identity types shared across the client: server ids and connection infos.

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};

/// Opaque identity of one Redis instance, assigned monotonically at instance
/// creation. The sentinel value [`ServerId::any`] means "no preference".
///
/// A human-readable description ("host:port") is kept in a process-wide
/// registry so that log lines can show where an id points without threading
/// the connection info everywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServerId(i64);

static NEXT_SERVER_ID: AtomicI64 = AtomicI64::new(0);

static SERVER_DESCRIPTIONS: Lazy<RwLock<HashMap<i64, String>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

impl ServerId {
    /// The "no preference" id.
    pub const fn any() -> Self {
        ServerId(-1)
    }

    /// Allocates a fresh id and registers its description.
    pub fn generate(description: String) -> Self {
        let id = ServerId(NEXT_SERVER_ID.fetch_add(1, Ordering::Relaxed));
        SERVER_DESCRIPTIONS.write().insert(id.0, description);
        id
    }

    pub fn is_any(&self) -> bool {
        self.0 < 0
    }

    pub fn id(&self) -> i64 {
        self.0
    }

    /// The registered description, or an empty string for unknown/any ids.
    pub fn description(&self) -> String {
        SERVER_DESCRIPTIONS
            .read()
            .get(&self.0)
            .cloned()
            .unwrap_or_default()
    }

    /// Removes the description of a retired id from the registry.
    pub fn retire(&self) {
        SERVER_DESCRIPTIONS.write().remove(&self.0);
    }

    #[cfg(test)]
    pub(crate) fn from_raw(raw: i64) -> Self {
        ServerId(raw)
    }
}

impl Default for ServerId {
    fn default() -> Self {
        ServerId::any()
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_any() {
            write!(f, "any")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Where and how to connect to one Redis process.
///
/// Two values compare equal iff their canonical "host:port" form is equal;
/// this equality defines instance identity inside a shard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub host: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Carried for configuration compatibility; TLS handshakes are not
    /// performed and the flag is reported unsupported at connect time.
    #[serde(default)]
    pub tls: bool,
    /// Pre-resolved addresses, if the caller already did the lookup.
    #[serde(default, skip)]
    pub resolved: Vec<SocketAddr>,
    /// Optional datacenter tag for locality-aware strategies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datacenter: Option<String>,
}

impl ConnectionInfo {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            password: None,
            tls: false,
            resolved: Vec::new(),
            datacenter: None,
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// The canonical "host:port" form used as instance identity.
    pub fn host_port(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Parses a "host:port" string; the port is the last `:`-delimited
    /// integer, so bracketed IPv6 hosts work too.
    pub fn from_host_port(host_port: &str) -> Option<Self> {
        let (host, port) = split_host_port(host_port)?;
        Some(ConnectionInfo::new(host, port))
    }
}

impl PartialEq for ConnectionInfo {
    fn eq(&self, other: &Self) -> bool {
        self.host == other.host && self.port == other.port
    }
}

impl Eq for ConnectionInfo {}

impl std::hash::Hash for ConnectionInfo {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.host.hash(state);
        self.port.hash(state);
    }
}

impl fmt::Display for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Splits "host:port", stripping IPv6 brackets from the host.
/// Returns `None` when there is no `:` or the port does not parse.
pub fn split_host_port(s: &str) -> Option<(String, u16)> {
    let idx = s.rfind(':')?;
    let port = s[idx + 1..].parse::<u16>().ok()?;
    let host = s[..idx].trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return None;
    }
    Some((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_ids_are_unique_and_described() {
        let a = ServerId::generate("10.0.0.1:6379".into());
        let b = ServerId::generate("10.0.0.2:6379".into());
        assert_ne!(a, b);
        assert_eq!(a.description(), "10.0.0.1:6379");
        assert!(!a.is_any());
        assert!(ServerId::any().is_any());
    }

    #[test]
    fn connection_info_identity_is_host_port() {
        let a = ConnectionInfo::new("redis-1", 6379).with_password("secret");
        let b = ConnectionInfo::new("redis-1", 6379);
        let c = ConnectionInfo::new("redis-1", 6380);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn parses_ipv6_host_port() {
        let (host, port) = split_host_port("[2001:db8::1]:7000").unwrap();
        assert_eq!(host, "2001:db8::1");
        assert_eq!(port, 7000);
        assert!(split_host_port("no-port").is_none());
    }
}
