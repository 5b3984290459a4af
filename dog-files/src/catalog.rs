use chrono::Utc;
use std::sync::Arc;

use crate::keyed_mutex::KeyedMutex;
use crate::record::RecordStore;
use crate::{FileId, FileRecord, FileStatus, FilesError, FilesResult};

/// Mapping from file id to its descriptive record.
///
/// Read-modify-write updates for one id are serialized, so a status transition is
/// decided against the record as it stands.
pub struct MetadataCatalog {
    records: Arc<dyn RecordStore<FileRecord>>,
    locks: KeyedMutex<FileId>,
}

impl MetadataCatalog {
    pub fn new(records: Arc<dyn RecordStore<FileRecord>>) -> Self {
        Self {
            records,
            locks: KeyedMutex::new(),
        }
    }

    /// Store a new record; fails when the id is taken
    pub async fn insert(&self, record: FileRecord) -> FilesResult<FileRecord> {
        let _guard = self.locks.lock(record.id.clone()).await;
        if self.records.get(&record.id).await?.is_some() {
            return Err(FilesError::AlreadyExists {
                id: record.id.to_string(),
            });
        }
        self.records.upsert(&record.id, &record).await?;
        Ok(record)
    }

    pub async fn get(&self, id: &FileId) -> FilesResult<FileRecord> {
        self.find(id)
            .await?
            .ok_or_else(|| FilesError::not_found(id.as_str()))
    }

    pub async fn find(&self, id: &FileId) -> FilesResult<Option<FileRecord>> {
        self.records.get(id).await
    }

    /// Move the record to `to` only if its status is one of `from`.
    ///
    /// Returns `None`, leaving the record untouched, when the status did not match.
    pub async fn transition<F>(
        &self,
        id: &FileId,
        from: &[FileStatus],
        to: FileStatus,
        change: F,
    ) -> FilesResult<Option<FileRecord>>
    where
        F: FnOnce(&mut FileRecord) + Send,
    {
        let _guard = self.locks.lock(id.clone()).await;
        let mut record = self.get(id).await?;
        if !from.contains(&record.status) {
            return Ok(None);
        }
        change(&mut record);
        record.status = to;
        record.updated_at = Utc::now();
        self.records.upsert(id, &record).await?;
        Ok(Some(record))
    }

    pub async fn remove(&self, id: &FileId) -> FilesResult<()> {
        let _guard = self.locks.lock(id.clone()).await;
        self.records.remove(id).await
    }

    /// Records visible to `principal`, oldest first
    pub async fn list_owned(&self, principal: Option<&str>) -> FilesResult<Vec<FileRecord>> {
        let mut records: Vec<FileRecord> = self
            .records
            .list()
            .await?
            .into_iter()
            .filter(|record| record.is_owned_by(principal))
            .collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(records)
    }

    /// All records, in no particular order
    pub async fn list(&self) -> FilesResult<Vec<FileRecord>> {
        self.records.list().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::MemoryRecordStore;
    use crate::FileMetadata;

    fn record(id: &str, owner: Option<&str>) -> FileRecord {
        let now = Utc::now();
        FileRecord {
            id: FileId::from(id),
            name: format!("{}.bin", id),
            extension: "bin".to_string(),
            size: 10,
            chunk_size: 5,
            declared_mime: None,
            mime: "application/octet-stream".to_string(),
            owner: owner.map(str::to_string),
            metadata: FileMetadata::default(),
            status: FileStatus::Initiated,
            checksum: None,
            is_video: false,
            is_audio: false,
            is_image: false,
            is_text: false,
            is_json: false,
            is_pdf: false,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    #[tokio::test]
    async fn transition_only_applies_from_expected_states() {
        let catalog = MetadataCatalog::new(Arc::new(MemoryRecordStore::new()));
        let id = FileId::from("a");
        catalog.insert(record("a", None)).await.unwrap();
        assert!(matches!(
            catalog.insert(record("a", None)).await,
            Err(FilesError::AlreadyExists { .. })
        ));

        let moved = catalog
            .transition(&id, &[FileStatus::Initiated], FileStatus::InProgress, |_| {})
            .await
            .unwrap();
        assert_eq!(moved.unwrap().status, FileStatus::InProgress);

        let skipped = catalog
            .transition(&id, &[FileStatus::Initiated], FileStatus::InProgress, |r| {
                r.size = 99
            })
            .await
            .unwrap();
        assert!(skipped.is_none());
        assert_eq!(catalog.get(&id).await.unwrap().size, 10);
    }

    #[tokio::test]
    async fn listing_filters_by_owner() {
        let catalog = MetadataCatalog::new(Arc::new(MemoryRecordStore::new()));
        catalog.insert(record("a", Some("ann"))).await.unwrap();
        catalog.insert(record("b", Some("bob"))).await.unwrap();
        catalog.insert(record("c", None)).await.unwrap();

        let owned = catalog.list_owned(Some("ann")).await.unwrap();
        assert_eq!(owned.len(), 1);
        assert_eq!(owned[0].id, FileId::from("a"));
        assert_eq!(catalog.list_owned(None).await.unwrap().len(), 1);

        catalog.remove(&FileId::from("a")).await.unwrap();
        assert!(matches!(
            catalog.get(&FileId::from("a")).await,
            Err(FilesError::NotFound { .. })
        ));
    }
}
