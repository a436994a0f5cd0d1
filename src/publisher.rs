//! Writes the discovered address into the coordination store.

use std::time::Duration;

use log::{info, warn};

use crate::store::{CoordinationStore, KeyPath, StoreError};
use crate::types::{Encoding, PublishedRecord};

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("failed to encode value: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("failed to write value: {0}")]
    Store(#[from] StoreError),
}

/// TTL attached to every write: the interval rounded up to whole
/// seconds plus the buffer.
pub fn ttl_seconds(interval: Duration, buffer: Duration) -> u64 {
    let interval_secs = interval.as_secs() + u64::from(interval.subsec_nanos() > 0);
    interval_secs + buffer.as_secs()
}

pub struct Publisher<S> {
    store: S,
    host_ip: String,
    encoding: Encoding,
    ttl: u64,
}

impl<S: CoordinationStore> Publisher<S> {
    pub fn new(store: S, host_ip: impl Into<String>, encoding: Encoding, ttl: u64) -> Self {
        Self {
            store,
            host_ip: host_ip.into(),
            encoding,
            ttl,
        }
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    #[cfg(test)]
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Refresh cluster membership.  A failure is logged and the peers
    /// already known stay in use.
    pub async fn sync_cluster(&mut self) {
        if let Err(e) = self.store.sync_cluster().await {
            warn!("Cluster sync failed, using known peers: {}", e);
        }
    }

    /// Publish `host_ip:port` at `key`.
    pub async fn publish(
        &mut self,
        key: &KeyPath,
        port: u16,
    ) -> Result<PublishedRecord, PublishError> {
        let record = PublishedRecord::new(self.host_ip.clone(), port);
        let value = record.encode(self.encoding)?;

        info!("Setting {} = `{}` (ttl {}s)", key, value, self.ttl);
        self.store.set(&key.to_string(), &value, self.ttl).await?;
        Ok(record)
    }
}
