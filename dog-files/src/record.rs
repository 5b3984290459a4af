use async_trait::async_trait;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::warn;
use uuid::Uuid;

use crate::{FileId, FilesError, FilesResult};

/// Key-value record storage with atomic upsert, keyed by file id
#[async_trait]
pub trait RecordStore<V>: Send + Sync
where
    V: Clone + Send + Sync + 'static,
{
    /// Get a record
    async fn get(&self, key: &FileId) -> FilesResult<Option<V>>;

    /// Insert or atomically replace a record
    async fn upsert(&self, key: &FileId, value: &V) -> FilesResult<()>;

    /// Remove a record; removing a missing key is not an error
    async fn remove(&self, key: &FileId) -> FilesResult<()>;

    /// All records, in no particular order
    async fn list(&self) -> FilesResult<Vec<V>>;
}

/// In-memory record store for testing and development
pub struct MemoryRecordStore<V> {
    records: Arc<RwLock<HashMap<FileId, V>>>,
}

impl<V> MemoryRecordStore<V> {
    pub fn new() -> Self {
        Self {
            records: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl<V> Default for MemoryRecordStore<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> Clone for MemoryRecordStore<V> {
    fn clone(&self) -> Self {
        Self {
            records: self.records.clone(),
        }
    }
}

#[async_trait]
impl<V> RecordStore<V> for MemoryRecordStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &FileId) -> FilesResult<Option<V>> {
        Ok(self.records.read().get(key).cloned())
    }

    async fn upsert(&self, key: &FileId, value: &V) -> FilesResult<()> {
        self.records.write().insert(key.clone(), value.clone());
        Ok(())
    }

    async fn remove(&self, key: &FileId) -> FilesResult<()> {
        self.records.write().remove(key);
        Ok(())
    }

    async fn list(&self) -> FilesResult<Vec<V>> {
        Ok(self.records.read().values().cloned().collect())
    }
}

/// Durable record store: one JSON document per key in a directory.
///
/// Upserts write a temporary file, fsync it and rename it over the old document,
/// so readers see either the previous or the new record.
pub struct JsonDirRecordStore<V> {
    root: PathBuf,
    _marker: PhantomData<fn() -> V>,
}

impl<V> JsonDirRecordStore<V> {
    /// Open (creating if needed) a record directory
    pub async fn open<P: AsRef<Path>>(root: P) -> FilesResult<Self> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self {
            root,
            _marker: PhantomData,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &FileId) -> FilesResult<PathBuf> {
        if !key.is_path_safe() {
            return Err(FilesError::invalid(format!("unsafe record key {:?}", key.as_str())));
        }
        Ok(self.root.join(format!("{}.json", key.as_str())))
    }
}

#[async_trait]
impl<V> RecordStore<V> for JsonDirRecordStore<V>
where
    V: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &FileId) -> FilesResult<Option<V>> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn upsert(&self, key: &FileId, value: &V) -> FilesResult<()> {
        let path = self.path_for(key)?;
        let tmp = self
            .root
            .join(format!(".{}.{}.tmp", key.as_str(), Uuid::new_v4().simple()));
        let body = serde_json::to_vec(value)?;

        let write = async {
            let mut file = tokio::fs::File::create(&tmp).await?;
            file.write_all(&body).await?;
            file.sync_all().await?;
            tokio::fs::rename(&tmp, &path).await
        };

        if let Err(e) = write.await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn remove(&self, key: &FileId) -> FilesResult<()> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self) -> FilesResult<Vec<V>> {
        let mut records = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_record = path.extension().is_some_and(|ext| ext == "json")
                && !entry.file_name().to_string_lossy().starts_with('.');
            if !is_record {
                continue;
            }
            let bytes = tokio::fs::read(&path).await?;
            match serde_json::from_slice(&bytes) {
                Ok(record) => records.push(record),
                Err(e) => warn!("Skipping unreadable record {}: {}", path.display(), e),
            }
        }
        Ok(records)
    }
}
