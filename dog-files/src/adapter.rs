use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{info, warn};

use crate::catalog::MetadataCatalog;
use crate::coordinator::{DefaultUploadCoordinator, UploadCoordinator};
use crate::events::{EventBus, FileEvent};
use crate::record::{MemoryRecordStore, RecordStore};
use crate::registry::SessionRegistry;
use crate::streamer::{Download, DownloadOptions, RangeReader, RangeStreamer};
use crate::sweeper::ExpirySweeper;
use crate::{
    BlobHandle, ChunkAck, ChunkStore, ChunkWriteRequest, FileId, FileRecord, FileStatus,
    FilesConfig, FilesCtx, FilesError, FilesResult, InitiateUpload, RangeSpec, UploadProgress,
    UploadSession, UploadTicket,
};

/// The main files adapter - this is what services embed to accept uploads and serve downloads
pub struct FilesAdapter {
    store: Arc<dyn ChunkStore>,
    uploads: Arc<dyn UploadCoordinator>,
    streamer: RangeStreamer,
    catalog: Arc<MetadataCatalog>,
    registry: Arc<SessionRegistry>,
    events: EventBus,
    config: FilesConfig,
}

/// Builder for [`FilesAdapter`]; record stores default to in-memory ones
pub struct FilesAdapterBuilder {
    store: Arc<dyn ChunkStore>,
    config: FilesConfig,
    records: Option<Arc<dyn RecordStore<FileRecord>>>,
    sessions: Option<Arc<dyn RecordStore<UploadSession>>>,
}

impl FilesAdapterBuilder {
    pub fn config(mut self, config: FilesConfig) -> Self {
        self.config = config;
        self
    }

    /// Where file records are kept
    pub fn records<R: RecordStore<FileRecord> + 'static>(mut self, records: R) -> Self {
        self.records = Some(Arc::new(records));
        self
    }

    /// Where upload session snapshots are kept
    pub fn sessions<R: RecordStore<UploadSession> + 'static>(mut self, sessions: R) -> Self {
        self.sessions = Some(Arc::new(sessions));
        self
    }

    pub fn build(self) -> FilesResult<FilesAdapter> {
        self.config.validate()?;

        let records: Arc<dyn RecordStore<FileRecord>> = match self.records {
            Some(records) => records,
            None => Arc::new(MemoryRecordStore::<FileRecord>::new()),
        };
        let sessions: Arc<dyn RecordStore<UploadSession>> = match self.sessions {
            Some(sessions) => sessions,
            None => Arc::new(MemoryRecordStore::<UploadSession>::new()),
        };

        let catalog = Arc::new(MetadataCatalog::new(records));
        let registry = Arc::new(SessionRegistry::new(sessions, self.config.session_timeout));
        let events = EventBus::new(self.config.event_capacity);

        let uploads = Arc::new(DefaultUploadCoordinator::new(
            self.store.clone(),
            registry.clone(),
            catalog.clone(),
            events.clone(),
            self.config.clone(),
        ));
        let streamer = RangeStreamer::new(
            self.store.clone(),
            catalog.clone(),
            registry.clone(),
            self.config.clone(),
        );

        Ok(FilesAdapter {
            store: self.store,
            uploads,
            streamer,
            catalog,
            registry,
            events,
            config: self.config,
        })
    }
}

impl FilesAdapter {
    /// Start building an adapter over `store`
    pub fn builder<S: ChunkStore + 'static>(store: S) -> FilesAdapterBuilder {
        FilesAdapterBuilder {
            store: Arc::new(store),
            config: FilesConfig::default(),
            records: None,
            sessions: None,
        }
    }

    /// Create an adapter with in-memory record stores
    pub fn new<S: ChunkStore + 'static>(store: S, config: FilesConfig) -> FilesResult<Self> {
        Self::builder(store).config(config).build()
    }

    pub fn config(&self) -> &FilesConfig {
        &self.config
    }

    /// Start a chunked upload
    pub async fn initiate_upload(&self, ctx: FilesCtx, request: InitiateUpload) -> FilesResult<UploadTicket> {
        self.uploads.initiate(ctx, request).await
    }

    /// Deliver one chunk; safe to retry
    pub async fn upload_chunk(&self, ctx: FilesCtx, request: ChunkWriteRequest) -> FilesResult<ChunkAck> {
        self.uploads.upload_chunk(ctx, request).await
    }

    pub async fn abort_upload(&self, ctx: FilesCtx, file_id: &FileId) -> FilesResult<()> {
        self.uploads.abort(ctx, file_id).await
    }

    /// Chunks still missing for an upload, for clients that reconnect
    pub async fn resume_upload(&self, ctx: FilesCtx, file_id: &FileId, token: &str) -> FilesResult<UploadProgress> {
        self.uploads.resume(ctx, file_id, token).await
    }

    /// True once every chunk has been received
    pub async fn is_upload_complete(&self, ctx: FilesCtx, file_id: &FileId) -> FilesResult<bool> {
        ctx.authorize()?;
        match self.registry.is_complete(file_id).await {
            Ok(complete) => Ok(complete),
            Err(FilesError::NotFound { .. }) => {
                Ok(self.catalog.get(file_id).await?.status == FileStatus::Complete)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn get_file_info(&self, ctx: FilesCtx, file_id: &FileId) -> FilesResult<FileRecord> {
        ctx.authorize()?;
        self.catalog.get(file_id).await
    }

    /// Files owned by the calling principal, oldest first
    pub async fn list_files(&self, ctx: FilesCtx) -> FilesResult<Vec<FileRecord>> {
        ctx.authorize()?;
        self.catalog.list_owned(ctx.principal.as_deref()).await
    }

    /// Resolve a download, honoring an optional `Range` header
    pub async fn open_download(&self, ctx: FilesCtx, file_id: &FileId, options: DownloadOptions) -> FilesResult<Download> {
        ctx.authorize()?;
        self.streamer.open_download(file_id, options).await
    }

    /// Open a restartable reader over the whole file or a set of ranges
    pub async fn open_read(&self, ctx: FilesCtx, file_id: &FileId, spec: RangeSpec) -> FilesResult<RangeReader> {
        ctx.authorize()?;
        self.streamer.open_read(file_id, spec).await
    }

    pub async fn delete_file(&self, ctx: FilesCtx, file_id: &FileId) -> FilesResult<()> {
        self.uploads.delete(ctx, file_id).await
    }

    /// Expire idle sessions now, returning their ids
    pub async fn expire_stale(&self, now: DateTime<Utc>) -> FilesResult<Vec<FileId>> {
        self.uploads.expire_stale(now).await
    }

    /// Subscribe to state-transition events
    pub fn subscribe(&self) -> BroadcastStream<FileEvent> {
        self.events.subscribe()
    }

    /// Sweeper running at the configured interval
    pub fn sweeper(&self) -> ExpirySweeper {
        ExpirySweeper::new(self.uploads.clone(), self.config.sweep_interval)
    }

    /// Run the sweeper on the current runtime
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        self.sweeper().spawn()
    }

    /// Reload persisted sessions after a restart.
    ///
    /// Sessions that had received every chunk before the crash are finalized now. Records left in an active state without a session can never complete; they are
    /// aborted and their partial blobs deleted. Returns the number of restored sessions.
    pub async fn restore(&self) -> FilesResult<usize> {
        let restored = self.uploads.recover().await?;

        let mut orphaned = 0;
        for record in self.catalog.list().await? {
            if !record.status.is_active() || self.registry.contains(&record.id) {
                continue;
            }
            let aborted = self
                .catalog
                .transition(
                    &record.id,
                    &[FileStatus::Initiated, FileStatus::InProgress],
                    FileStatus::Aborted,
                    |_| {},
                )
                .await?;
            if aborted.is_none() {
                continue;
            }
            if let Err(e) = self.store.delete(&BlobHandle::new(record.id.clone(), record.size)).await {
                warn!(file_id = %record.id, "failed to delete orphaned blob: {}", e);
            }
            orphaned += 1;
        }

        info!("Restored {} upload sessions, aborted {} orphaned uploads", restored, orphaned);
        Ok(restored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_store::MemoryChunkStore;
    use crate::Access;
    use bytes::Bytes;
    use futures::StreamExt;

    fn adapter() -> FilesAdapter {
        FilesAdapter::new(MemoryChunkStore::new(), FilesConfig::default()).unwrap()
    }

    async fn upload(adapter: &FilesAdapter, ctx: &FilesCtx, name: &str, body: &'static [u8]) -> FileId {
        let ticket = adapter
            .initiate_upload(ctx.clone(), InitiateUpload::new(name, body.len() as u64).with_chunk_size(4))
            .await
            .unwrap();
        for (index, part) in body.chunks(4).enumerate() {
            let index = index as u64;
            adapter
                .upload_chunk(
                    ctx.clone(),
                    ChunkWriteRequest::new(ticket.file_id.clone(), index, index * 4, Bytes::from_static(part)),
                )
                .await
                .unwrap();
        }
        ticket.file_id
    }

    #[test]
    fn build_rejects_invalid_config() {
        let config = FilesConfig::default().with_read_segment_bytes(0);
        assert!(matches!(
            FilesAdapter::new(MemoryChunkStore::new(), config),
            Err(FilesError::Invalid { .. })
        ));
    }

    #[tokio::test]
    async fn denied_context_is_refused_everywhere() {
        let adapter = adapter();
        let ctx = FilesCtx::new("alice");
        let file_id = upload(&adapter, &ctx, "a.txt", b"hello world").await;

        let denied = ctx.clone().with_access(Access::Denied);
        assert!(matches!(
            adapter.get_file_info(denied.clone(), &file_id).await,
            Err(FilesError::Forbidden)
        ));
        assert!(matches!(adapter.list_files(denied.clone()).await, Err(FilesError::Forbidden)));
        assert!(matches!(
            adapter.open_download(denied.clone(), &file_id, DownloadOptions::new()).await,
            Err(FilesError::Forbidden)
        ));
        assert!(matches!(
            adapter.delete_file(denied, &file_id).await,
            Err(FilesError::Forbidden)
        ));
    }

    #[tokio::test]
    async fn lists_only_the_callers_files() {
        let adapter = adapter();
        let alice = FilesCtx::new("alice");
        let bob = FilesCtx::new("bob");
        let first = upload(&adapter, &alice, "one.txt", b"first file").await;
        upload(&adapter, &bob, "two.txt", b"second").await;

        let files = adapter.list_files(alice).await.unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].id, first);
        assert_eq!(files[0].mime, "text/plain");
    }

    #[tokio::test]
    async fn completed_upload_reads_back() {
        let adapter = adapter();
        let ctx = FilesCtx::new("alice");
        let file_id = upload(&adapter, &ctx, "a.txt", b"hello world").await;
        assert!(adapter.is_upload_complete(ctx.clone(), &file_id).await.unwrap());

        let reader = adapter.open_read(ctx, &file_id, RangeSpec::Whole).await.unwrap();
        let parts: Vec<_> = reader.stream().collect().await;
        let body: Vec<u8> = parts.into_iter().flat_map(|part| part.unwrap().to_vec()).collect();
        assert_eq!(body, b"hello world");
    }

    #[tokio::test]
    async fn restore_aborts_records_without_sessions() {
        let records = MemoryRecordStore::<FileRecord>::new();
        let store = MemoryChunkStore::new();
        let ctx = FilesCtx::new("alice");

        let first = FilesAdapter::builder(store.clone())
            .records(records.clone())
            .build()
            .unwrap();
        let ticket = first
            .initiate_upload(ctx.clone(), InitiateUpload::new("a.bin", 8).with_chunk_size(4))
            .await
            .unwrap();

        // Fresh session store: the in-flight upload cannot be resumed.
        let second = FilesAdapter::builder(store.clone()).records(records).build().unwrap();
        assert_eq!(second.restore().await.unwrap(), 0);

        let record = second.get_file_info(ctx, &ticket.file_id).await.unwrap();
        assert_eq!(record.status, FileStatus::Aborted);
        assert!(!store.contains(&ticket.file_id));
    }
}
