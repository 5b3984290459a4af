use async_trait::async_trait;
use bytes::Bytes;

use crate::{ByteRange, ByteStream, FileId, FilesResult};

/// Durable byte storage keyed by file id - must be implemented by all storage backends.
///
/// Every operation is durable when it returns: a successful `write_chunk` means the
/// bytes survive a crash. Writes to disjoint offsets of the same blob may run
/// concurrently; writes to the same offset are serialized.
#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// Reserve `total_size` bytes for a new blob.
    ///
    /// Fails with `CapacityExceeded` when the backend is full and `AlreadyExists`
    /// when the id is already allocated.
    async fn allocate(&self, id: &FileId, total_size: u64) -> FilesResult<BlobHandle>;

    /// Write `bytes` at `offset`
    async fn write_chunk(&self, handle: &BlobHandle, offset: u64, bytes: Bytes) -> FilesResult<()>;

    /// Stream the bytes in `range`, yielding segments of at most `segment_bytes`.
    ///
    /// The storage handle is owned by the returned stream and released when it is
    /// dropped, whether or not it was read to the end.
    async fn read_range(
        &self,
        handle: &BlobHandle,
        range: ByteRange,
        segment_bytes: usize,
    ) -> FilesResult<ByteStream>;

    /// Mark the blob immutable and readable; idempotent
    async fn finalize(&self, handle: &BlobHandle) -> FilesResult<BlobHandle>;

    /// Remove the blob; deleting a missing blob is not an error
    async fn delete(&self, handle: &BlobHandle) -> FilesResult<()>;

    /// Look up an existing blob
    async fn open(&self, id: &FileId) -> FilesResult<BlobHandle>;
}

/// Reference to an allocated blob
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobHandle {
    pub id: FileId,
    pub size: u64,
    pub sealed: bool,
}

impl BlobHandle {
    pub fn new(id: FileId, size: u64) -> Self {
        Self {
            id,
            size,
            sealed: false,
        }
    }

    pub fn sealed(mut self) -> Self {
        self.sealed = true;
        self
    }

    pub fn full_range(&self) -> ByteRange {
        ByteRange::new(0, self.size)
    }
}
