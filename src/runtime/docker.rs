use super::{ContainerRuntime, ResolveError};
use crate::config::TlsMaterial;
use crate::types::{ContainerPort, PortTable, Protocol};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bollard::container::{InspectContainerOptions, ListContainersOptions};
use bollard::models::{ContainerInspectResponse, ContainerSummary, PortTypeEnum};
use bollard::{Docker, API_DEFAULT_VERSION};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How the tracked container is located on each iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Lookup {
    /// Inspect the container directly by ID or name.
    #[default]
    Inspect,
    /// List running containers and pick the one matching the reference.
    Scan,
}

pub struct DockerRuntime {
    docker: Docker,
    lookup: Lookup,
}

impl DockerRuntime {
    /// Builds a client for `endpoint`.  No request is made here, so an
    /// unreachable daemon only shows up on the first iteration.
    pub fn connect(
        endpoint: &str,
        tls: Option<&TlsMaterial>,
        timeout: Duration,
        lookup: Lookup,
    ) -> Result<Self> {
        let timeout = timeout.as_secs().max(1);
        let connected = if endpoint.starts_with("unix://") {
            Docker::connect_with_unix(endpoint, timeout, API_DEFAULT_VERSION)
        } else if let Some(tls) = tls {
            info!("Using TLS material from {}", tls.dir.display());
            Docker::connect_with_ssl(
                endpoint,
                &tls.key,
                &tls.cert,
                &tls.ca,
                timeout,
                API_DEFAULT_VERSION,
            )
        } else if endpoint.starts_with("https://") {
            return Err(anyhow!(
                "Docker endpoint {} requires TLS but DOCKER_CERT_PATH is not set",
                endpoint
            ));
        } else {
            Docker::connect_with_http(endpoint, timeout, API_DEFAULT_VERSION)
        };
        let docker = connected
            .with_context(|| format!("Failed to create Docker client for {}", endpoint))?;

        Ok(Self { docker, lookup })
    }

    async fn inspect(&self, container: &str) -> Result<PortTable, ResolveError> {
        let detail = self
            .docker
            .inspect_container(container, None::<InspectContainerOptions>)
            .await
            .map_err(|e| runtime_error(container, e))?;
        ports_from_inspect(container, &detail)
    }

    async fn scan(&self, container: &str) -> Result<PortTable, ResolveError> {
        let opts = ListContainersOptions::<String> {
            all: false,
            ..Default::default()
        };
        let containers = self
            .docker
            .list_containers(Some(opts))
            .await
            .map_err(|e| runtime_error(container, e))?;

        let summary = select_container(&containers, container)
            .ok_or_else(|| ResolveError::ContainerNotFound(container.to_string()))?;
        Ok(ports_from_summary(summary))
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn port_table(&self, container: &str) -> Result<PortTable, ResolveError> {
        let table = match self.lookup {
            Lookup::Inspect => self.inspect(container).await?,
            Lookup::Scan => self.scan(container).await?,
        };
        if table.is_empty() {
            debug!("Container {} publishes no ports", container);
        } else {
            debug!("Container {} has {} port bindings", container, table.len());
        }
        Ok(table)
    }
}

fn runtime_error(container: &str, err: bollard::errors::Error) -> ResolveError {
    match err {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        } => ResolveError::ContainerNotFound(container.to_string()),
        other => ResolveError::Runtime(other.to_string()),
    }
}

/// Builds the port table from `NetworkSettings.Ports`.  Keys are visited
/// in sorted order; bindings under one key keep the daemon's order.
fn ports_from_inspect(
    container: &str,
    detail: &ContainerInspectResponse,
) -> Result<PortTable, ResolveError> {
    let settings = detail
        .network_settings
        .as_ref()
        .ok_or_else(|| ResolveError::NoNetworkSettings(container.to_string()))?;

    let mut table = PortTable::default();
    let Some(ports) = &settings.ports else {
        return Ok(table);
    };

    let mut keys: Vec<&String> = ports.keys().collect();
    keys.sort();
    for key in keys {
        let internal: ContainerPort = match key.parse() {
            Ok(p) => p,
            Err(e) => {
                debug!("Skipping port key {} on {}: {}", key, container, e);
                continue;
            }
        };
        // `None` means the port is exposed but not published.
        for binding in ports.get(key).into_iter().flatten().flatten() {
            table.push(internal, binding.host_port.clone().unwrap_or_default());
        }
    }
    Ok(table)
}

/// Resolves `reference` the way the daemon does: exact ID, then exact
/// name, then an ID prefix shared by exactly one container.
fn select_container<'a>(
    containers: &'a [ContainerSummary],
    reference: &str,
) -> Option<&'a ContainerSummary> {
    fn id_of(c: &ContainerSummary) -> &str {
        c.id.as_deref().unwrap_or_default()
    }

    let name = reference.trim_start_matches('/');
    if name.is_empty() {
        return None;
    }

    if let Some(c) = containers.iter().find(|c| id_of(c) == reference) {
        return Some(c);
    }
    if let Some(c) = containers
        .iter()
        .find(|c| c.names.iter().flatten().any(|n| n.trim_start_matches('/') == name))
    {
        return Some(c);
    }
    let mut prefixed = containers.iter().filter(|c| id_of(c).starts_with(reference));
    match (prefixed.next(), prefixed.next()) {
        (Some(c), None) => Some(c),
        (Some(_), Some(_)) => {
            debug!("ID prefix {} is ambiguous", reference);
            None
        }
        _ => None,
    }
}

fn ports_from_summary(summary: &ContainerSummary) -> PortTable {
    let mut table = PortTable::default();
    for port in summary.ports.iter().flatten() {
        let Some(public) = port.public_port else {
            continue;
        };
        let protocol = match port.typ {
            Some(PortTypeEnum::UDP) => Protocol::Udp,
            Some(PortTypeEnum::SCTP) => Protocol::Sctp,
            _ => Protocol::Tcp,
        };
        let internal = ContainerPort {
            port: port.private_port,
            protocol,
        };
        table.push(internal, public.to_string());
    }
    table
}
