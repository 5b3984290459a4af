use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use crate::{BlobHandle, ByteRange, ByteStream, ChunkStore, FileId, FilesError, FilesResult};

struct MemoryBlob {
    data: Vec<u8>,
    sealed: bool,
}

/// In-memory chunk store for testing and development
#[derive(Clone, Default)]
pub struct MemoryChunkStore {
    blobs: Arc<RwLock<HashMap<FileId, MemoryBlob>>>,
    capacity: Option<u64>,
}

impl MemoryChunkStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Limit the total bytes this store may allocate
    pub fn with_capacity(mut self, bytes: u64) -> Self {
        self.capacity = Some(bytes);
        self
    }

    /// Bytes reserved by all blobs
    pub fn used_bytes(&self) -> u64 {
        self.blobs
            .read()
            .values()
            .map(|blob| blob.data.len() as u64)
            .sum()
    }

    pub fn contains(&self, id: &FileId) -> bool {
        self.blobs.read().contains_key(id)
    }

    pub fn blob_count(&self) -> usize {
        self.blobs.read().len()
    }
}

#[async_trait]
impl ChunkStore for MemoryChunkStore {
    async fn allocate(&self, id: &FileId, total_size: u64) -> FilesResult<BlobHandle> {
        let len = usize::try_from(total_size)
            .map_err(|_| FilesError::invalid_size("blob too large for memory store"))?;

        let mut blobs = self.blobs.write();
        if blobs.contains_key(id) {
            return Err(FilesError::AlreadyExists { id: id.to_string() });
        }
        if let Some(capacity) = self.capacity {
            let used: u64 = blobs.values().map(|blob| blob.data.len() as u64).sum();
            let available = capacity.saturating_sub(used);
            if total_size > available {
                return Err(FilesError::CapacityExceeded {
                    requested: total_size,
                    available,
                });
            }
        }

        blobs.insert(
            id.clone(),
            MemoryBlob {
                data: vec![0; len],
                sealed: false,
            },
        );
        Ok(BlobHandle::new(id.clone(), total_size))
    }

    async fn write_chunk(&self, handle: &BlobHandle, offset: u64, bytes: Bytes) -> FilesResult<()> {
        let mut blobs = self.blobs.write();
        let blob = blobs
            .get_mut(&handle.id)
            .ok_or_else(|| FilesError::not_found(handle.id.as_str()))?;
        if blob.sealed {
            return Err(FilesError::invalid(format!("blob {} is sealed", handle.id)));
        }

        let size = blob.data.len() as u64;
        let end = offset.saturating_add(bytes.len() as u64);
        if end > size {
            return Err(FilesError::OutOfRange {
                start: offset,
                end,
                size,
            });
        }
        blob.data[offset as usize..end as usize].copy_from_slice(&bytes);
        Ok(())
    }

    async fn read_range(
        &self,
        handle: &BlobHandle,
        range: ByteRange,
        segment_bytes: usize,
    ) -> FilesResult<ByteStream> {
        let bytes = {
            let blobs = self.blobs.read();
            let blob = blobs
                .get(&handle.id)
                .ok_or_else(|| FilesError::not_found(handle.id.as_str()))?;
            let size = blob.data.len() as u64;
            if range.start > range.end || range.end > size {
                return Err(FilesError::OutOfRange {
                    start: range.start,
                    end: range.end,
                    size,
                });
            }
            Bytes::copy_from_slice(&blob.data[range.start as usize..range.end as usize])
        };

        let segment = segment_bytes.max(1);
        let segments: Vec<Result<Bytes, std::io::Error>> = (0..bytes.len())
            .step_by(segment)
            .map(|start| Ok(bytes.slice(start..(start + segment).min(bytes.len()))))
            .collect();
        Ok(Box::pin(futures::stream::iter(segments)))
    }

    async fn finalize(&self, handle: &BlobHandle) -> FilesResult<BlobHandle> {
        let mut blobs = self.blobs.write();
        let blob = blobs
            .get_mut(&handle.id)
            .ok_or_else(|| FilesError::not_found(handle.id.as_str()))?;
        blob.sealed = true;
        Ok(handle.clone().sealed())
    }

    async fn delete(&self, handle: &BlobHandle) -> FilesResult<()> {
        self.blobs.write().remove(&handle.id);
        Ok(())
    }

    async fn open(&self, id: &FileId) -> FilesResult<BlobHandle> {
        let blobs = self.blobs.read();
        let blob = blobs
            .get(id)
            .ok_or_else(|| FilesError::not_found(id.as_str()))?;
        let handle = BlobHandle::new(id.clone(), blob.data.len() as u64);
        Ok(if blob.sealed { handle.sealed() } else { handle })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn segments_cover_the_requested_range() {
        let store = MemoryChunkStore::new();
        let id = FileId::from("m");
        let handle = store.allocate(&id, 10).await.unwrap();
        store.write_chunk(&handle, 0, Bytes::from_static(b"0123456789")).await.unwrap();

        let segments: Vec<Bytes> = store
            .read_range(&handle, ByteRange::new(1, 8), 3)
            .await
            .unwrap()
            .map(|segment| segment.unwrap())
            .collect()
            .await;
        assert_eq!(segments.len(), 3);
        assert_eq!(segments.concat(), b"1234567");
    }

    #[tokio::test]
    async fn sealed_blobs_reject_writes() {
        let store = MemoryChunkStore::new();
        let handle = store.allocate(&FileId::from("s"), 4).await.unwrap();
        store.finalize(&handle).await.unwrap();
        assert!(store.open(&handle.id).await.unwrap().sealed);
        assert!(store
            .write_chunk(&handle, 0, Bytes::from_static(b"late"))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn capacity_is_shared_across_blobs() {
        let store = MemoryChunkStore::new().with_capacity(8);
        store.allocate(&FileId::from("a"), 5).await.unwrap();
        assert!(matches!(
            store.allocate(&FileId::from("b"), 4).await,
            Err(FilesError::CapacityExceeded { requested: 4, available: 3 })
        ));
        assert_eq!(store.used_bytes(), 5);
    }
}
