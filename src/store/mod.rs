//! Coordination store access.
//!
//! The daemon needs three things from the store: a write with a TTL,
//! directory creation for the ancestors of the key, and a membership
//! refresh so a moved or resized cluster is still reachable.

use std::fmt;

use async_trait::async_trait;
use log::debug;

pub mod etcd;
#[cfg(test)]
pub(crate) mod memory;

pub use etcd::EtcdStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("no store peer reachable: {0}")]
    Unreachable(String),
    #[error("store error {code}: {message} ({cause})")]
    Api {
        code: u64,
        message: String,
        cause: String,
    },
    #[error("unexpected store response: {0}")]
    Protocol(String),
    #[error("cluster reported no client URLs")]
    NoMembers,
}

/// Result of a directory creation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirStatus {
    Created,
    Existing,
}

#[async_trait]
pub trait CoordinationStore: Send {
    /// Refresh the known peer list from the cluster itself.
    async fn sync_cluster(&mut self) -> Result<(), StoreError>;

    /// Create `dir`.  An existing directory is reported, not an error.
    async fn create_dir(&mut self, dir: &str) -> Result<DirStatus, StoreError>;

    /// Write `value` at `key`, expiring after `ttl` seconds.
    async fn set(&mut self, key: &str, value: &str, ttl: u64) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("store key `{0}` has no leaf segment")]
pub struct EmptyKey(String);

/// A normalized slash-delimited store key: a leading `/`, no empty or
/// trailing segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPath {
    segments: Vec<String>,
}

impl KeyPath {
    pub fn parse(raw: &str) -> Result<Self, EmptyKey> {
        let segments: Vec<String> = raw
            .split('/')
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
        if segments.is_empty() {
            return Err(EmptyKey(raw.to_string()));
        }
        Ok(Self { segments })
    }

    /// Every directory above the leaf, shallowest first.  The root is
    /// implicit and never listed.
    pub fn ancestors(&self) -> Vec<String> {
        let mut dirs = Vec::with_capacity(self.segments.len().saturating_sub(1));
        let mut path = String::new();
        for segment in &self.segments[..self.segments.len() - 1] {
            path.push('/');
            path.push_str(segment);
            dirs.push(path.clone());
        }
        dirs
    }
}

impl fmt::Display for KeyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for segment in &self.segments {
            write!(f, "/{}", segment)?;
        }
        Ok(())
    }
}

/// Ensure every ancestor directory of `key` exists.  Stops at the first
/// directory that cannot be created.
pub async fn materialize_path<S>(store: &mut S, key: &KeyPath) -> Result<(), StoreError>
where
    S: CoordinationStore + ?Sized,
{
    for dir in key.ancestors() {
        if store.create_dir(&dir).await? == DirStatus::Created {
            debug!("Created directory {}", dir);
        }
    }
    Ok(())
}
