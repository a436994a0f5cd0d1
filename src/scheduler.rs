//! The discovery loop.
//!
//! Every iteration sleeps a jittered fraction of the interval, resolves
//! the tracked port and publishes it.  A failed iteration is logged and
//! the next one starts after the usual sleep; there is no backoff and no
//! retry budget.

use std::time::Duration;

use anyhow::Result;
use log::{debug, error, info, warn};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::publisher::{PublishError, Publisher};
use crate::runtime::{resolve_port, ContainerRuntime, ResolveError};
use crate::store::{materialize_path, CoordinationStore, KeyPath, StoreError};
use crate::types::{ContainerPort, PublishedRecord};

/// Range the per-iteration sleep is drawn from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Jitter {
    /// `[0, interval)`
    #[default]
    Full,
    /// `[interval / 2, interval)`
    Midpoint,
}

pub fn sleep_duration<G>(rng: &mut G, interval: Duration, jitter: Jitter) -> Duration
where
    G: Rng,
{
    let nanos = u64::try_from(interval.as_nanos()).unwrap_or(u64::MAX);
    if nanos == 0 {
        return Duration::ZERO;
    }
    let low = match jitter {
        Jitter::Full => 0,
        Jitter::Midpoint => nanos / 2,
    };
    Duration::from_nanos(rng.gen_range(low..nanos))
}

#[derive(Debug, thiserror::Error)]
pub enum IterationError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error("failed to create parent directories of {key}: {source}")]
    Materialize { key: String, source: StoreError },
    #[error(transparent)]
    Publish(#[from] PublishError),
}

pub struct Scheduler<R, S, G> {
    runtime: R,
    publisher: Publisher<S>,
    container: String,
    port: ContainerPort,
    key: KeyPath,
    interval: Duration,
    jitter: Jitter,
    rng: G,
}

impl<R, S, G> Scheduler<R, S, G>
where
    R: ContainerRuntime,
    S: CoordinationStore,
    G: Rng,
{
    pub fn new(runtime: R, publisher: Publisher<S>, config: &Config, rng: G) -> Result<Self> {
        Ok(Self {
            runtime,
            publisher,
            container: config.container.clone(),
            port: config.container_port,
            key: KeyPath::parse(&config.key)?,
            interval: config.interval,
            jitter: config.jitter,
            rng,
        })
    }

    /// One resolve, sync, materialize, publish pass without the sleep.
    pub async fn tick(&mut self) -> Result<PublishedRecord, IterationError> {
        let mapping = resolve_port(&self.runtime, &self.container, &self.port).await?;
        debug!(
            "Container {} maps {} to host port {}",
            self.container, mapping.internal, mapping.external
        );

        self.publisher.sync_cluster().await;
        materialize_path(self.publisher.store_mut(), &self.key)
            .await
            .map_err(|source| IterationError::Materialize {
                key: self.key.to_string(),
                source,
            })?;

        Ok(self.publisher.publish(&self.key, mapping.external).await?)
    }

    /// Runs until the future is dropped.
    pub async fn run(&mut self) {
        loop {
            let nap = sleep_duration(&mut self.rng, self.interval, self.jitter);
            info!("Sleeping {:?}", nap);
            tokio::time::sleep(nap).await;

            if let Err(e) = self.tick().await {
                report(&e);
            }
        }
    }
}

fn report(err: &IterationError) {
    match err {
        // Usually a container that is still starting.
        IterationError::Resolve(ResolveError::PortNotBound { .. }) => info!("{}", err),
        IterationError::Resolve(ResolveError::MalformedPort { .. }) => warn!("{}", err),
        IterationError::Resolve(ResolveError::Runtime(e)) => error!("Docker error: {}", e),
        IterationError::Resolve(e) => error!("{}", e),
        IterationError::Materialize { .. } => error!("etcd error: {}", err),
        IterationError::Publish(PublishError::Store(e)) => error!("etcd error: {}", e),
        IterationError::Publish(e) => warn!("{}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::fake::FakeRuntime;
    use crate::store::memory::{MemoryStore, Op};
    use crate::types::{Encoding, PortTable};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn config() -> Config {
        Config {
            container: "web1".into(),
            key: "/services/web/primary".into(),
            host_ip: "10.0.0.5".into(),
            ..Config::default()
        }
    }

    fn web1() -> FakeRuntime {
        let mut table = PortTable::default();
        table.push(ContainerPort::tcp(80), "32768");
        FakeRuntime::default().with_container("web1", table)
    }

    fn scheduler(
        runtime: FakeRuntime,
        store: MemoryStore,
        config: &Config,
    ) -> Scheduler<FakeRuntime, MemoryStore, StdRng> {
        let publisher = Publisher::new(
            store,
            config.host_ip.clone(),
            config.encoding,
            config.ttl_seconds(),
        );
        Scheduler::new(runtime, publisher, config, StdRng::seed_from_u64(7)).unwrap()
    }

    #[test]
    fn full_jitter_stays_below_interval() {
        let mut rng = StdRng::seed_from_u64(1);
        let interval = Duration::from_secs(30);
        for _ in 0..10_000 {
            let d = sleep_duration(&mut rng, interval, Jitter::Full);
            assert!(d < interval);
        }
    }

    #[test]
    fn midpoint_jitter_stays_in_upper_half() {
        let mut rng = StdRng::seed_from_u64(2);
        let interval = Duration::from_millis(1500);
        for _ in 0..10_000 {
            let d = sleep_duration(&mut rng, interval, Jitter::Midpoint);
            assert!(d >= interval / 2 && d < interval, "{:?}", d);
        }
    }

    #[test]
    fn tiny_intervals_do_not_panic() {
        let mut rng = StdRng::seed_from_u64(3);
        for jitter in [Jitter::Full, Jitter::Midpoint] {
            assert_eq!(sleep_duration(&mut rng, Duration::from_nanos(1), jitter), Duration::ZERO);
            assert_eq!(sleep_duration(&mut rng, Duration::ZERO, jitter), Duration::ZERO);
        }
    }

    #[tokio::test]
    async fn tick_materializes_then_publishes() {
        let cfg = config();
        let mut s = scheduler(web1(), MemoryStore::default(), &cfg);

        let record = s.tick().await.unwrap();
        assert_eq!(record.to_string(), "10.0.0.5:32768");
        assert_eq!(
            s.publisher.store().ops(),
            vec![
                Op::Sync,
                Op::CreateDir("/services".into()),
                Op::CreateDir("/services/web".into()),
                Op::Set {
                    key: "/services/web/primary".into(),
                    value: "10.0.0.5:32768".into(),
                    ttl: 35,
                },
            ]
        );
    }

    #[tokio::test]
    async fn tick_publishes_json_when_configured() {
        let cfg = Config {
            encoding: Encoding::Json,
            ..config()
        };
        let mut s = scheduler(web1(), MemoryStore::default(), &cfg);

        s.tick().await.unwrap();
        assert_eq!(
            s.publisher.store().get("/services/web/primary").as_deref(),
            Some(r#"{"host":"10.0.0.5","port":32768}"#)
        );
    }

    #[tokio::test]
    async fn unbound_port_writes_nothing() {
        let cfg = Config {
            container_port: ContainerPort::tcp(443),
            ..config()
        };
        let mut s = scheduler(web1(), MemoryStore::default(), &cfg);

        let err = s.tick().await.unwrap_err();
        assert!(matches!(
            err,
            IterationError::Resolve(ResolveError::PortNotBound { .. })
        ));
        assert!(s.publisher.store().ops().is_empty());
    }

    #[tokio::test]
    async fn malformed_port_writes_nothing() {
        let mut table = PortTable::default();
        table.push(ContainerPort::tcp(80), "0");
        let runtime = FakeRuntime::default().with_container("web1", table);
        let cfg = config();
        let mut s = scheduler(runtime, MemoryStore::default(), &cfg);

        let err = s.tick().await.unwrap_err();
        assert!(matches!(
            err,
            IterationError::Resolve(ResolveError::MalformedPort { .. })
        ));
        assert!(s.publisher.store().ops().is_empty());
    }

    #[tokio::test]
    async fn sync_failure_still_publishes() {
        let mut store = MemoryStore::default();
        store.fail_sync = true;
        let cfg = config();
        let mut s = scheduler(web1(), store, &cfg);

        s.tick().await.unwrap();
        assert_eq!(s.publisher.store().ops()[0], Op::Sync);
        assert_eq!(s.publisher.store().sets().len(), 1);
    }

    #[tokio::test]
    async fn directory_failure_skips_write() {
        let mut store = MemoryStore::default();
        store.fail_create_dir = true;
        let cfg = config();
        let mut s = scheduler(web1(), store, &cfg);

        let err = s.tick().await.unwrap_err();
        assert!(matches!(err, IterationError::Materialize { .. }));
        assert!(s.publisher.store().sets().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn missing_container_keeps_loop_running() {
        let runtime = web1();
        let cfg = Config {
            container: "web2".into(),
            ..config()
        };
        let mut s = scheduler(runtime.clone(), MemoryStore::default(), &cfg);

        let outcome = tokio::time::timeout(Duration::from_secs(300), s.run()).await;
        assert!(outcome.is_err(), "run loop must not return");
        assert!(runtime.call_count() >= 10);
        assert!(s.publisher.store().ops().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn loop_refreshes_before_ttl_lapses() {
        let cfg = Config {
            jitter: Jitter::Midpoint,
            ..config()
        };
        let mut s = scheduler(web1(), MemoryStore::default(), &cfg);

        let _ = tokio::time::timeout(Duration::from_secs(600), s.run()).await;
        let sets = s.publisher.store().sets();
        // Midpoint jitter sleeps at least 15s, at most 30s.
        assert!(sets.len() >= 20 && sets.len() <= 40, "{} sets", sets.len());
        assert!(s.publisher.store().get("/services/web/primary").is_some());
    }
}
