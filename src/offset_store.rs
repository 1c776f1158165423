//! Durable per-(endpoint, batch) delivered-byte ledger.
//!
//! Layout: `<root>/<ledger key>/batch-<id>`, each file holding the decimal
//! number of bytes of that batch already accepted by the sink. Writes go to a
//! temporary file that is fsynced and renamed over the record, so a crash
//! leaves either the old or the new value.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::endpoint::Endpoint;
use crate::error::CollectorError;

/// File-backed offset ledger shared by all pods of a process.
#[derive(Debug, Clone)]
pub struct OffsetStore {
    root: PathBuf,
}

impl OffsetStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Working directory of one endpoint.
    pub fn pod_dir(&self, endpoint: &Endpoint) -> PathBuf {
        self.root.join(endpoint.ledger_key())
    }

    pub fn batch_path(&self, endpoint: &Endpoint, batch_id: u64) -> PathBuf {
        self.pod_dir(endpoint).join(format!("batch-{}", batch_id))
    }

    /// Create the endpoint's directory. Returns `true` if it did not exist.
    pub async fn ensure_pod_dir(&self, endpoint: &Endpoint) -> Result<bool, CollectorError> {
        let dir = self.pod_dir(endpoint);
        let existed = tokio::fs::try_exists(&dir)
            .await
            .map_err(|e| CollectorError::storage(&dir, e))?;
        if !existed {
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|e| CollectorError::storage(&dir, e))?;
            debug!(path = %dir.display(), "Created pod working directory");
        }
        Ok(!existed)
    }

    /// Bytes delivered for a batch; 0 when there is no record yet.
    pub async fn read(&self, endpoint: &Endpoint, batch_id: u64) -> Result<u64, CollectorError> {
        let path = self.batch_path(endpoint, batch_id);
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => match contents.trim().parse::<u64>() {
                Ok(bytes) => Ok(bytes),
                Err(_) => {
                    warn!(
                        path = %path.display(),
                        contents = %contents.trim(),
                        "Unreadable offset record, treating as 0"
                    );
                    Ok(0)
                }
            },
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(0),
            Err(e) => Err(CollectorError::storage(path, e)),
        }
    }

    /// Durably record the delivered byte count for a batch.
    pub async fn write(
        &self,
        endpoint: &Endpoint,
        batch_id: u64,
        bytes: u64,
    ) -> Result<(), CollectorError> {
        let dir = self.pod_dir(endpoint);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| CollectorError::storage(&dir, e))?;

        let path = self.batch_path(endpoint, batch_id);
        let tmp = dir.join(format!("batch-{}.tmp", batch_id));

        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| CollectorError::storage(&tmp, e))?;
        file.write_all(bytes.to_string().as_bytes())
            .await
            .map_err(|e| CollectorError::storage(&tmp, e))?;
        file.sync_all()
            .await
            .map_err(|e| CollectorError::storage(&tmp, e))?;
        drop(file);

        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| CollectorError::storage(&path, e))?;

        // Persist the rename itself
        #[cfg(unix)]
        {
            let parent = tokio::fs::File::open(&dir)
                .await
                .map_err(|e| CollectorError::storage(&dir, e))?;
            parent
                .sync_all()
                .await
                .map_err(|e| CollectorError::storage(&dir, e))?;
        }

        Ok(())
    }
}

/// A pod's view of the ledger: lazily seeded, write-through cache.
#[derive(Debug)]
pub struct OffsetLedger {
    store: OffsetStore,
    endpoint: Endpoint,
    cache: HashMap<u64, u64>,
}

impl OffsetLedger {
    pub fn new(store: OffsetStore, endpoint: Endpoint) -> Self {
        Self {
            store,
            endpoint,
            cache: HashMap::new(),
        }
    }

    pub fn work_dir(&self) -> PathBuf {
        self.store.pod_dir(&self.endpoint)
    }

    /// Create the working directory; `true` on first contact with this endpoint.
    pub async fn attach(&self) -> Result<bool, CollectorError> {
        self.store.ensure_pod_dir(&self.endpoint).await
    }

    /// Delivered bytes for a batch, reading the store on first reference.
    pub async fn delivered(&mut self, batch_id: u64) -> Result<u64, CollectorError> {
        if let Some(bytes) = self.cache.get(&batch_id) {
            return Ok(*bytes);
        }
        let bytes = self.store.read(&self.endpoint, batch_id).await?;
        self.cache.insert(batch_id, bytes);
        Ok(bytes)
    }

    /// Advance a batch's offset by `size` bytes. The store is written before
    /// the cache so a failed write leaves the old value in effect.
    pub async fn commit(&mut self, batch_id: u64, size: u64) -> Result<u64, CollectorError> {
        let current = self.delivered(batch_id).await?;
        let next = current + size;
        self.store.write(&self.endpoint, batch_id, next).await?;
        self.cache.insert(batch_id, next);
        Ok(next)
    }

    /// Set a batch's offset outright (first-contact history skip). Never lowers it.
    pub async fn mark_delivered(&mut self, batch_id: u64, bytes: u64) -> Result<(), CollectorError> {
        let current = self.delivered(batch_id).await?;
        if bytes <= current {
            return Ok(());
        }
        self.store.write(&self.endpoint, batch_id, bytes).await?;
        self.cache.insert(batch_id, bytes);
        Ok(())
    }
}
