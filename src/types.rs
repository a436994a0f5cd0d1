//! Data structures used throughout the remora daemon.
//!
//! A port table is rebuilt from the container runtime on every
//! iteration and the resulting [`PublishedRecord`] is written to the
//! coordination store.  Nothing here outlives a single iteration.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Transport protocol of a container port.  Docker reports it as the
/// suffix of the port key, e.g. `80/tcp`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
    Sctp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Sctp => "sctp",
        };
        f.write_str(s)
    }
}

impl FromStr for Protocol {
    type Err = PortParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            "sctp" => Ok(Protocol::Sctp),
            other => Err(PortParseError::Protocol(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PortParseError {
    #[error("invalid port number `{0}`")]
    Number(String),
    #[error("unknown protocol `{0}`")]
    Protocol(String),
}

/// A container-internal port, optionally qualified by transport.
/// `"80"` and `"80/tcp"` are the same port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "PortSpec", into = "String")]
pub struct ContainerPort {
    pub port: u16,
    pub protocol: Protocol,
}

impl ContainerPort {
    pub fn tcp(port: u16) -> Self {
        Self {
            port,
            protocol: Protocol::Tcp,
        }
    }
}

impl fmt::Display for ContainerPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.port, self.protocol)
    }
}

impl FromStr for ContainerPort {
    type Err = PortParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (number, protocol) = match s.split_once('/') {
            Some((number, proto)) => (number, proto.parse()?),
            None => (s, Protocol::default()),
        };
        let port = number
            .parse::<u16>()
            .ok()
            .filter(|p| *p > 0)
            .ok_or_else(|| PortParseError::Number(number.to_string()))?;
        Ok(Self { port, protocol })
    }
}

impl From<ContainerPort> for String {
    fn from(port: ContainerPort) -> Self {
        port.to_string()
    }
}

/// Config files may spell the port as a bare number or as `port/proto`.
#[derive(Deserialize)]
#[serde(untagged)]
enum PortSpec {
    Number(u16),
    Text(String),
}

impl TryFrom<PortSpec> for ContainerPort {
    type Error = PortParseError;

    fn try_from(spec: PortSpec) -> Result<Self, Self::Error> {
        match spec {
            PortSpec::Number(0) => Err(PortParseError::Number("0".into())),
            PortSpec::Number(port) => Ok(ContainerPort::tcp(port)),
            PortSpec::Text(text) => text.parse(),
        }
    }
}

/// One row of a container's port table.  The external side is kept as
/// the raw string the runtime reported so malformed values can be logged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortBinding {
    pub internal: ContainerPort,
    pub external: String,
}

/// A resolved (internal, external) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortMapping {
    pub internal: ContainerPort,
    pub external: u16,
}

/// The outcome of looking up one internal port in a [`PortTable`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortLookup {
    Found(PortMapping),
    NotBound,
    Malformed(String),
}

/// Port bindings of a single container in the order the runtime
/// reported them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortTable {
    bindings: Vec<PortBinding>,
}

impl PortTable {
    pub fn push(&mut self, internal: ContainerPort, external: impl Into<String>) {
        self.bindings.push(PortBinding {
            internal,
            external: external.into(),
        });
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Finds the first binding for `target`.  Later bindings for the same
    /// port (e.g. the IPv6 twin of an IPv4 binding) are ignored.
    pub fn lookup(&self, target: &ContainerPort) -> PortLookup {
        let Some(binding) = self.bindings.iter().find(|b| b.internal == *target) else {
            return PortLookup::NotBound;
        };
        match binding.external.trim().parse::<u16>() {
            Ok(external) if external > 0 => PortLookup::Found(PortMapping {
                internal: binding.internal,
                external,
            }),
            _ => PortLookup::Malformed(binding.external.clone()),
        }
    }
}

/// How a [`PublishedRecord`] is rendered into the store value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    /// `host:port`
    #[default]
    Plain,
    /// `{"host":"...","port":N}`
    Json,
}

/// The value written to the coordination store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedRecord {
    pub host: String,
    pub port: u16,
}

impl PublishedRecord {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn encode(&self, encoding: Encoding) -> serde_json::Result<String> {
        match encoding {
            Encoding::Plain => Ok(self.to_string()),
            Encoding::Json => serde_json::to_string(self),
        }
    }
}

impl fmt::Display for PublishedRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}
