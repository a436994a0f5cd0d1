use async_trait::async_trait;

use crate::types::{ContainerPort, PortLookup, PortMapping, PortTable};

pub mod docker;
pub use docker::{DockerRuntime, Lookup};

/// Why a container's external port could not be determined this round.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("container runtime error: {0}")]
    Runtime(String),
    #[error("container `{0}` not found")]
    ContainerNotFound(String),
    #[error("container `{0}` has no network settings")]
    NoNetworkSettings(String),
    #[error("container `{container}` does not publish port {port}")]
    PortNotBound {
        container: String,
        port: ContainerPort,
    },
    #[error("container `{container}` reports malformed host port `{value}` for {port}")]
    MalformedPort {
        container: String,
        port: ContainerPort,
        value: String,
    },
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Fetch the current port table of `container` (an ID or a name).
    async fn port_table(&self, container: &str) -> Result<PortTable, ResolveError>;
}

/// Resolve the host port bound to `port` inside `container`.
pub async fn resolve_port<R>(
    runtime: &R,
    container: &str,
    port: &ContainerPort,
) -> Result<PortMapping, ResolveError>
where
    R: ContainerRuntime + ?Sized,
{
    let table = runtime.port_table(container).await?;
    match table.lookup(port) {
        PortLookup::Found(mapping) => Ok(mapping),
        PortLookup::NotBound => Err(ResolveError::PortNotBound {
            container: container.to_string(),
            port: *port,
        }),
        PortLookup::Malformed(value) => Err(ResolveError::MalformedPort {
            container: container.to_string(),
            port: *port,
            value,
        }),
    }
}


#[cfg(test)]
mod tests {
    use super::fake::FakeRuntime;
    use super::*;

    fn web1() -> FakeRuntime {
        let mut table = PortTable::default();
        table.push(ContainerPort::tcp(80), "32768");
        table.push("53/udp".parse().unwrap(), "not-a-port");
        FakeRuntime::default().with_container("web1", table)
    }

    #[tokio::test]
    async fn resolves_bound_port() {
        let mapping = resolve_port(&web1(), "web1", &ContainerPort::tcp(80))
            .await
            .unwrap();
        assert_eq!(mapping.external, 32768);
    }

    #[tokio::test]
    async fn unbound_port_is_not_bound() {
        let err = resolve_port(&web1(), "web1", &ContainerPort::tcp(443))
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::PortNotBound { .. }));
    }

    #[tokio::test]
    async fn malformed_port_fails_resolution() {
        let err = resolve_port(&web1(), "web1", &"53/udp".parse().unwrap())
            .await
            .unwrap_err();
        match err {
            ResolveError::MalformedPort { value, .. } => assert_eq!(value, "not-a-port"),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn missing_container_is_not_found() {
        let err = resolve_port(&web1(), "web2", &ContainerPort::tcp(80))
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::ContainerNotFound(name) if name == "web2"));
    }
}
