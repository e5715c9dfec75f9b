//! Durable instance store: one record per instance id, optimistic
//! concurrency on every write, tombstones retained until explicitly purged.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

use cloudsim_common::InstanceRecord;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),
    #[error("version conflict on {id}: expected {expected}, stored {actual}")]
    VersionConflict {
        id: String,
        expected: u64,
        actual: u64,
    },
    #[error("record is not terminal: {0}")]
    NotTerminal(String),
    #[error("store io failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("store serialization failure: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Single-writer-per-record discipline: `put` succeeds only when the caller
/// read the version it is replacing. `expected_version == 0` inserts.
#[async_trait]
pub trait InstanceStore: Send + Sync {
    async fn get(&self, id: &str) -> StoreResult<InstanceRecord>;
    /// All records in creation order, readable without the engine.
    async fn list(&self) -> StoreResult<Vec<InstanceRecord>>;
    async fn put(
        &self,
        record: InstanceRecord,
        expected_version: u64,
    ) -> StoreResult<InstanceRecord>;
    /// Remove a tombstone. Refuses non-terminal records; delete is never
    /// exposed for a live instance.
    async fn purge(&self, id: &str) -> StoreResult<()>;
}

/// Store backed by a single local JSON file, rewritten atomically on every
/// put (temp file + rename). The whole system persists to local JSON; this
/// store is the only shared mutable resource.
pub struct JsonFileStore {
    path: PathBuf,
    records: RwLock<HashMap<String, InstanceRecord>>,
}

impl JsonFileStore {
    pub async fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let records = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };
        debug!(path = %path.display(), "instance store opened");
        Ok(Self {
            path,
            records: RwLock::new(records),
        })
    }

    async fn persist(&self, records: &HashMap<String, InstanceRecord>) -> StoreResult<()> {
        let bytes = serde_json::to_vec_pretty(records)?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl InstanceStore for JsonFileStore {
    async fn get(&self, id: &str) -> StoreResult<InstanceRecord> {
        self.records
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn list(&self) -> StoreResult<Vec<InstanceRecord>> {
        let records = self.records.read().await;
        let mut all: Vec<InstanceRecord> = records.values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(all)
    }

    async fn put(
        &self,
        mut record: InstanceRecord,
        expected_version: u64,
    ) -> StoreResult<InstanceRecord> {
        let mut records = self.records.write().await;
        let actual = records.get(&record.id).map(|r| r.version).unwrap_or(0);
        if actual != expected_version {
            return Err(StoreError::VersionConflict {
                id: record.id.clone(),
                expected: expected_version,
                actual,
            });
        }
        record.version = expected_version + 1;
        records.insert(record.id.clone(), record.clone());
        self.persist(&records).await?;
        Ok(record)
    }

    async fn purge(&self, id: &str) -> StoreResult<()> {
        let mut records = self.records.write().await;
        let record = records
            .get(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        if !record.is_tombstone() {
            return Err(StoreError::NotTerminal(id.to_string()));
        }
        records.remove(id);
        self.persist(&records).await?;
        Ok(())
    }
}
