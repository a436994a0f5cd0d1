//! In-memory store used by the tests.  Expiry follows tokio's clock so
//! paused-time tests can observe TTL lapses.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use tokio::time::{Duration, Instant};

use super::{CoordinationStore, DirStatus, StoreError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Sync,
    CreateDir(String),
    Set { key: String, value: String, ttl: u64 },
}

#[derive(Default)]
pub struct MemoryStore {
    dirs: BTreeSet<String>,
    values: BTreeMap<String, (String, Instant)>,
    ops: Vec<Op>,
    pub fail_sync: bool,
    pub fail_create_dir: bool,
    pub fail_set: bool,
}

impl MemoryStore {
    pub fn ops(&self) -> Vec<Op> {
        self.ops.clone()
    }

    pub fn sets(&self) -> Vec<Op> {
        self.ops
            .iter()
            .filter(|op| matches!(op, Op::Set { .. }))
            .cloned()
            .collect()
    }

    pub fn dirs(&self) -> BTreeSet<String> {
        self.dirs.clone()
    }

    pub fn is_dir(&self, dir: &str) -> bool {
        self.dirs.contains(dir)
    }

    /// Current value of `key`, or `None` once its TTL has lapsed.
    pub fn get(&self, key: &str) -> Option<String> {
        self.values
            .get(key)
            .filter(|(_, expires)| Instant::now() < *expires)
            .map(|(value, _)| value.clone())
    }

    fn failure(op: &str) -> StoreError {
        StoreError::Unreachable(format!("injected {} failure", op))
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn sync_cluster(&mut self) -> Result<(), StoreError> {
        self.ops.push(Op::Sync);
        if self.fail_sync {
            return Err(Self::failure("sync"));
        }
        Ok(())
    }

    async fn create_dir(&mut self, dir: &str) -> Result<DirStatus, StoreError> {
        self.ops.push(Op::CreateDir(dir.to_string()));
        if self.fail_create_dir {
            return Err(Self::failure("mkdir"));
        }
        if self.dirs.insert(dir.to_string()) {
            Ok(DirStatus::Created)
        } else {
            Ok(DirStatus::Existing)
        }
    }

    async fn set(&mut self, key: &str, value: &str, ttl: u64) -> Result<(), StoreError> {
        self.ops.push(Op::Set {
            key: key.to_string(),
            value: value.to_string(),
            ttl,
        });
        if self.fail_set {
            return Err(Self::failure("set"));
        }
        let expires = Instant::now() + Duration::from_secs(ttl);
        self.values
            .insert(key.to_string(), (value.to_string(), expires));
        Ok(())
    }
}
