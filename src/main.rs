//! Remora daemon entry point.
//!
//! Tracks one container port and keeps `host:port` alive in etcd under a
//! TTL for as long as the process runs.

use log::{error, info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::signal;

mod config;
mod publisher;
mod runtime;
mod scheduler;
mod store;
mod types;

use config::Config;
use publisher::Publisher;
use runtime::DockerRuntime;
use scheduler::Scheduler;
use store::EtcdStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // Load configuration
    let cfg = Config::load()?;
    info!("Starting remora with config: {:?}", cfg);

    let ttl = cfg.ttl_seconds();
    if ttl <= cfg.interval.as_secs() {
        warn!(
            "TTL of {}s does not exceed the {:?} interval; the key may lapse between writes",
            ttl, cfg.interval
        );
    }

    // Container runtime (Docker)
    let tls = cfg.docker_tls();
    let runtime = DockerRuntime::connect(
        &cfg.docker_host,
        tls.as_ref(),
        cfg.request_timeout,
        cfg.lookup,
    )
    .inspect_err(|e| error!("{:#}", e))?;

    // Coordination store (etcd)
    let store = EtcdStore::new(&cfg.etcd_peers, cfg.request_timeout)
        .inspect_err(|e| error!("{:#}", e))?;
    info!("Publishing to etcd peers {:?}", store.peers());

    let publisher = Publisher::new(store, cfg.host_ip.clone(), cfg.encoding, ttl);
    let mut scheduler = Scheduler::new(runtime, publisher, &cfg, StdRng::from_entropy())?;

    info!(
        "Tracking port {} of container {} at {}",
        cfg.container_port, cfg.container, cfg.key
    );

    // The key is left to expire through its TTL.
    tokio::select! {
        _ = scheduler.run() => {}
        res = signal::ctrl_c() => match res {
            Ok(()) => info!("Received Ctrl+C, shutting down..."),
            Err(err) => error!("Unable to listen for shutdown signal: {}", err),
        },
    }

    info!("Shutdown complete.");
    Ok(())
}
