use anyhow::{anyhow, bail, Result};
use clap::Parser;
use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Deserializer, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::publisher::ttl_seconds;
use crate::runtime::Lookup;
use crate::scheduler::Jitter;
use crate::store::KeyPath;
use crate::types::{ContainerPort, Encoding};

/// Publish the host port of a Docker container to etcd.
#[derive(Debug, Default, Parser)]
#[command(name = "remora", version)]
pub struct Cli {
    /// Comma-delimited list of etcd peer URLs
    #[arg(short = 'C', long, value_delimiter = ',')]
    pub etcd_peers: Option<Vec<String>>,
    /// Docker daemon endpoint
    #[arg(short = 'H', long)]
    pub docker_host: Option<String>,
    /// Host IP address to advertise
    #[arg(short = 'a', long)]
    pub host_ip: Option<String>,
    /// Container port to report, e.g. `80` or `53/udp`
    #[arg(short = 'p', long = "port")]
    pub container_port: Option<ContainerPort>,
    /// Polling interval
    #[arg(short = 'i', long, value_parser = humantime::parse_duration)]
    pub interval: Option<Duration>,
    /// Added to the interval to form the TTL
    #[arg(short = 'b', long, value_parser = humantime::parse_duration)]
    pub buffer: Option<Duration>,
    /// Timeout for each Docker and etcd request
    #[arg(long = "timeout", value_parser = humantime::parse_duration)]
    pub request_timeout: Option<Duration>,
    /// Store values as JSON objects instead of `host:port`
    #[arg(short = 'j', long)]
    pub json: bool,
    /// Range each sleep is drawn from
    #[arg(long, value_enum)]
    pub jitter: Option<Jitter>,
    /// How the container is located on the daemon
    #[arg(long, value_enum)]
    pub lookup: Option<Lookup>,
    /// Container ID or name
    pub container: Option<String>,
    /// etcd key to publish under
    pub key: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(deserialize_with = "peer_list")]
    pub etcd_peers: Vec<String>,
    pub docker_host: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub docker_cert_path: Option<PathBuf>,
    pub host_ip: String,
    pub container_port: ContainerPort,
    #[serde(with = "duration")]
    pub interval: Duration,
    #[serde(with = "duration")]
    pub buffer: Duration,
    #[serde(with = "duration")]
    pub request_timeout: Duration,
    pub encoding: Encoding,
    pub jitter: Jitter,
    pub lookup: Lookup,
    pub container: String,
    pub key: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            etcd_peers: vec!["http://127.0.0.1:4001".into()],
            docker_host: "unix:///var/run/docker.sock".into(),
            docker_cert_path: None,
            host_ip: "127.0.0.1".into(),
            container_port: ContainerPort::tcp(80),
            interval: Duration::from_secs(30),
            buffer: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
            encoding: Encoding::Plain,
            jitter: Jitter::Full,
            lookup: Lookup::Inspect,
            container: String::new(),
            key: String::new(),
        }
    }
}

/// Client certificate material for a TLS Docker endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsMaterial {
    pub dir: PathBuf,
    pub key: PathBuf,
    pub cert: PathBuf,
    pub ca: PathBuf,
}

impl TlsMaterial {
    pub fn from_dir(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            key: dir.join("key.pem"),
            cert: dir.join("cert.pem"),
            ca: dir.join("ca.pem"),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let cli = Cli::parse();
        let config: Config = Self::figment(&cli)
            .extract()
            .map_err(|e| anyhow!("Failed to load configuration: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults, then `remora.toml`, `remora.json`, `REMORA_*` variables,
    /// and finally the flags that were actually given.
    pub fn figment(cli: &Cli) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file("remora.toml"))
            .merge(Json::file("remora.json"))
            .merge(Env::prefixed("REMORA_"));

        if let Ok(path) = std::env::var("DOCKER_CERT_PATH") {
            if !path.is_empty() {
                figment = figment.merge(Serialized::default("docker_cert_path", path));
            }
        }

        if let Some(peers) = &cli.etcd_peers {
            figment = figment.merge(Serialized::default("etcd_peers", peers));
        }
        if let Some(host) = &cli.docker_host {
            figment = figment.merge(Serialized::default("docker_host", host));
        }
        if let Some(ip) = &cli.host_ip {
            figment = figment.merge(Serialized::default("host_ip", ip));
        }
        if let Some(port) = cli.container_port {
            figment = figment.merge(Serialized::default("container_port", port));
        }
        for (key, value) in [
            ("interval", cli.interval),
            ("buffer", cli.buffer),
            ("request_timeout", cli.request_timeout),
        ] {
            if let Some(d) = value {
                figment = figment.merge(Serialized::default(
                    key,
                    humantime::format_duration(d).to_string(),
                ));
            }
        }
        if cli.json {
            figment = figment.merge(Serialized::default("encoding", Encoding::Json));
        }
        if let Some(jitter) = cli.jitter {
            figment = figment.merge(Serialized::default("jitter", jitter));
        }
        if let Some(lookup) = cli.lookup {
            figment = figment.merge(Serialized::default("lookup", lookup));
        }
        if let Some(container) = &cli.container {
            figment = figment.merge(Serialized::default("container", container));
        }
        if let Some(key) = &cli.key {
            figment = figment.merge(Serialized::default("key", key));
        }
        figment
    }

    pub fn validate(&self) -> Result<()> {
        if self.interval.is_zero() {
            bail!("interval must be greater than zero");
        }
        if self.container.trim().is_empty() {
            bail!("missing container reference (first positional argument)");
        }
        if self.key.trim().is_empty() {
            bail!("missing etcd key (second positional argument)");
        }
        KeyPath::parse(&self.key)?;
        if self.etcd_peers.is_empty() {
            bail!("at least one etcd peer is required");
        }
        Ok(())
    }

    pub fn ttl_seconds(&self) -> u64 {
        ttl_seconds(self.interval, self.buffer)
    }

    pub fn docker_tls(&self) -> Option<TlsMaterial> {
        self.docker_cert_path.as_deref().map(TlsMaterial::from_dir)
    }
}

/// Accepts either a list or a comma-delimited string, so
/// `REMORA_ETCD_PEERS=http://a:4001,http://b:4001` works.
fn peer_list<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Peers {
        List(Vec<String>),
        Joined(String),
    }

    let peers = match Peers::deserialize(deserializer)? {
        Peers::List(list) => list,
        Peers::Joined(joined) => joined.split(',').map(String::from).collect(),
    };
    Ok(peers
        .into_iter()
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect())
}

/// Durations are written as humantime strings (`"30s"`, `"1m 30s"`);
/// bare integers are seconds.
mod duration {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*d).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Seconds(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Seconds(secs) => Ok(Duration::from_secs(secs)),
            Raw::Text(text) => humantime::parse_duration(text.trim()).map_err(D::Error::custom),
        }
    }
}
