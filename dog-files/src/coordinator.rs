use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use sha2::{Digest, Sha256};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::catalog::MetadataCatalog;
use crate::events::{EventBus, FileEvent};
use crate::keyed_mutex::KeyedMutex;
use crate::registry::{ChunkClaim, SessionRegistry};
use crate::sniff::{resolve_mime, sniff, SNIFF_LEN};
use crate::{
    extension_of, sanitize_name, BlobHandle, ByteRange, ChunkAck, ChunkLayout, ChunkStore,
    ChunkWriteRequest, FileId, FileRecord, FileStatus, FilesConfig, FilesCtx, FilesError,
    FilesResult, InitiateUpload, UploadProgress, UploadTicket,
};

const ACTIVE: &[FileStatus] = &[FileStatus::Initiated, FileStatus::InProgress];

/// The upload state machine: `Initiated → InProgress → Complete`, with `Aborted` and
/// `Expired` reachable from both active states.
#[async_trait]
pub trait UploadCoordinator: Send + Sync {
    /// Validate the request, register a session, allocate storage and create the record
    async fn initiate(&self, ctx: FilesCtx, request: InitiateUpload) -> FilesResult<UploadTicket>;

    /// Accept one chunk. Exactly one delivery per file reports `complete = true`.
    async fn upload_chunk(&self, ctx: FilesCtx, request: ChunkWriteRequest) -> FilesResult<ChunkAck>;

    /// Abandon an active upload and delete its partial blob
    async fn abort(&self, ctx: FilesCtx, file_id: &FileId) -> FilesResult<()>;

    /// Report which chunks are still missing; requires the session token
    async fn resume(&self, ctx: FilesCtx, file_id: &FileId, token: &str) -> FilesResult<UploadProgress>;

    /// Remove a file: aborts it first if still uploading
    async fn delete(&self, ctx: FilesCtx, file_id: &FileId) -> FilesResult<()>;

    /// Expire sessions idle for longer than the configured timeout
    async fn expire_stale(&self, now: DateTime<Utc>) -> FilesResult<Vec<FileId>>;

    /// Reload persisted sessions at startup and settle the ones a crash left mid-flight.
    /// Returns how many sessions were restored.
    async fn recover(&self) -> FilesResult<usize>;
}

/// Default coordinator over a [`ChunkStore`], a [`SessionRegistry`] and a [`MetadataCatalog`]
pub struct DefaultUploadCoordinator {
    store: Arc<dyn ChunkStore>,
    registry: Arc<SessionRegistry>,
    catalog: Arc<MetadataCatalog>,
    events: EventBus,
    chunk_locks: KeyedMutex<(FileId, u64)>,
    config: FilesConfig,
}

impl DefaultUploadCoordinator {
    pub fn new(
        store: Arc<dyn ChunkStore>,
        registry: Arc<SessionRegistry>,
        catalog: Arc<MetadataCatalog>,
        events: EventBus,
        config: FilesConfig,
    ) -> Self {
        Self {
            store,
            registry,
            catalog,
            events,
            chunk_locks: KeyedMutex::new(),
            config,
        }
    }

    pub fn config(&self) -> &FilesConfig {
        &self.config
    }

    /// Run a storage operation, retrying transient failures with linear backoff
    async fn with_retries<T, F, Fut>(&self, op: &str, file_id: &FileId, mut call: F) -> FilesResult<T>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = FilesResult<T>> + Send,
        T: Send,
    {
        let mut attempt = 0;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.config.storage_retries => {
                    attempt += 1;
                    warn!(file_id = %file_id, attempt, "{} failed, retrying: {}", op, e);
                    tokio::time::sleep(self.config.retry_backoff * attempt).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn check_initiate(&self, request: &InitiateUpload) -> FilesResult<ChunkLayout> {
        let rules = &self.config.upload_rules;
        if request.size > rules.max_file_bytes {
            return Err(FilesError::invalid_size(format!(
                "file size {} exceeds maximum {}",
                request.size, rules.max_file_bytes
            )));
        }

        let chunk_size = request.chunk_size.unwrap_or(rules.default_chunk_size);
        let layout = ChunkLayout::new(request.size, chunk_size)?;
        if chunk_size < rules.min_chunk_size || chunk_size > rules.max_chunk_size {
            return Err(FilesError::invalid_size(format!(
                "chunk size {} outside {}..={}",
                chunk_size, rules.min_chunk_size, rules.max_chunk_size
            )));
        }
        if layout.total_chunks > rules.max_chunks {
            return Err(FilesError::invalid_size(format!(
                "{} chunks exceeds maximum {}",
                layout.total_chunks, rules.max_chunks
            )));
        }

        request.metadata.validate()?;
        Ok(layout)
    }

    /// Reply for a chunk whose file has no active session
    async fn ack_without_session(&self, file_id: &FileId, index: u64) -> FilesResult<ChunkAck> {
        let record = self.catalog.get(file_id).await?;
        match record.status {
            FileStatus::Complete => {
                let total_chunks = record.size.div_ceil(record.chunk_size.max(1));
                if index >= total_chunks {
                    return Err(FilesError::out_of_bounds(
                        index,
                        format!("upload has {} chunks", total_chunks),
                    ));
                }
                Ok(ChunkAck {
                    accepted: true,
                    already_received: true,
                    complete: false,
                    received_chunks: total_chunks,
                    total_chunks,
                })
            }
            _ => Err(self.gone_error(file_id).await),
        }
    }

    /// Error for a file whose session disappeared mid-request
    async fn gone_error(&self, file_id: &FileId) -> FilesError {
        match self.catalog.find(file_id).await {
            Ok(Some(record)) => match record.status {
                FileStatus::Expired => FilesError::SessionExpired {
                    id: file_id.to_string(),
                },
                FileStatus::Complete => FilesError::not_found(file_id.as_str()),
                _ => FilesError::SessionAborted {
                    id: file_id.to_string(),
                },
            },
            Ok(None) => FilesError::not_found(file_id.as_str()),
            Err(e) => e,
        }
    }

    fn check_geometry(layout: &ChunkLayout, index: u64, offset: u64, len: u64) -> FilesResult<()> {
        if index >= layout.total_chunks {
            return Err(FilesError::out_of_bounds(
                index,
                format!("upload has {} chunks", layout.total_chunks),
            ));
        }
        let expected_offset = layout.offset_of(index);
        if offset != expected_offset {
            return Err(FilesError::out_of_bounds(
                index,
                format!("offset {} does not match chunk start {}", offset, expected_offset),
            ));
        }
        if offset.saturating_add(len) > layout.total_size {
            return Err(FilesError::size_mismatch(format!(
                "chunk ends at {} past declared size {}",
                offset.saturating_add(len),
                layout.total_size
            )));
        }
        let expected_len = layout.expected_len(index);
        if len != expected_len {
            return Err(FilesError::out_of_bounds(
                index,
                format!("length {} does not match expected {}", len, expected_len),
            ));
        }
        Ok(())
    }

    /// Seal the blob and mark the record Complete; on failure the upload is aborted
    async fn finalize(&self, file_id: &FileId, layout: &ChunkLayout) -> FilesResult<FileRecord> {
        let handle = BlobHandle::new(file_id.clone(), layout.total_size);
        match self.seal(&handle).await {
            Ok(record) => {
                if let Err(e) = self.registry.close(file_id, FileStatus::Complete).await {
                    warn!(file_id = %file_id, "session already closed after finalize: {}", e);
                }
                info!(file_id = %file_id, size = record.size, mime = %record.mime, "upload complete");
                self.events.publish(FileEvent::Completed {
                    file_id: file_id.clone(),
                    size: record.size,
                    mime: record.mime.clone(),
                    at: Utc::now(),
                });
                Ok(record)
            }
            Err(e) => {
                error!(file_id = %file_id, "finalize failed, aborting upload: {}", e);
                self.close_session(file_id, FileStatus::Aborted).await;
                self.discard(file_id, FileStatus::Aborted, format!("finalize failed: {}", e))
                    .await;
                Err(e)
            }
        }
    }

    async fn seal(&self, handle: &BlobHandle) -> FilesResult<FileRecord> {
        let file_id = &handle.id;
        let sealed = self
            .with_retries("finalize", file_id, || self.store.finalize(handle))
            .await?;

        let head = self.read_head(&sealed).await?;
        let sniffed = sniff(&head);
        let checksum = if self.config.compute_checksum {
            Some(self.digest(&sealed).await?)
        } else {
            None
        };

        let size = sealed.size;
        let record = self
            .catalog
            .transition(file_id, ACTIVE, FileStatus::Complete, move |record| {
                let mime = resolve_mime(sniffed, record.declared_mime.as_deref(), &record.extension);
                record.apply_mime(mime);
                record.size = size;
                record.checksum = checksum;
                record.completed_at = Some(Utc::now());
            })
            .await?;

        record.ok_or_else(|| FilesError::SessionAborted {
            id: file_id.to_string(),
        })
    }

    async fn read_head(&self, handle: &BlobHandle) -> FilesResult<Vec<u8>> {
        let end = handle.size.min(SNIFF_LEN as u64);
        let mut stream = self
            .store
            .read_range(handle, ByteRange::new(0, end), SNIFF_LEN)
            .await?;
        let mut head = Vec::with_capacity(end as usize);
        while let Some(segment) = stream.next().await {
            head.extend_from_slice(&segment?);
        }
        Ok(head)
    }

    async fn digest(&self, handle: &BlobHandle) -> FilesResult<String> {
        let mut stream = self
            .store
            .read_range(handle, handle.full_range(), self.config.read_segment_bytes)
            .await?;
        let mut hasher = Sha256::new();
        while let Some(segment) = stream.next().await {
            hasher.update(&segment?);
        }
        Ok(hex::encode(hasher.finalize()))
    }

    /// Close a session, logging when it was already gone
    async fn close_session(&self, file_id: &FileId, status: FileStatus) {
        if let Err(e) = self.registry.close(file_id, status).await {
            warn!(file_id = %file_id, "failed to close session as {}: {}", status.as_str(), e);
        }
    }

    async fn delete_blob(&self, file_id: &FileId) {
        let handle = BlobHandle::new(file_id.clone(), 0);
        if let Err(e) = self
            .with_retries("delete", file_id, || self.store.delete(&handle))
            .await
        {
            error!(file_id = %file_id, "failed to delete blob: {}", e);
        }
    }

    /// Move the record of a closed session to `status` and delete its blob.
    ///
    /// The blob is kept unless the record was still active: a record that already
    /// reached a terminal state owns whatever is stored.
    async fn discard(&self, file_id: &FileId, status: FileStatus, reason: String) {
        match self.catalog.transition(file_id, ACTIVE, status, |_| {}).await {
            Ok(Some(_)) | Err(FilesError::NotFound { .. }) => {}
            Ok(None) => {
                debug!(file_id = %file_id, "record already terminal, keeping blob");
                return;
            }
            Err(e) => {
                error!(file_id = %file_id, "failed to record {}: {}", status.as_str(), e);
                return;
            }
        }
        self.delete_blob(file_id).await;

        let at = Utc::now();
        match status {
            FileStatus::Expired => {
                info!(file_id = %file_id, "upload expired");
                self.events.publish(FileEvent::Expired {
                    file_id: file_id.clone(),
                    at,
                });
            }
            _ => {
                info!(file_id = %file_id, reason = %reason, "upload aborted");
                self.events.publish(FileEvent::Aborted {
                    file_id: file_id.clone(),
                    reason,
                    at,
                });
            }
        }
    }

    /// Abort a session from inside the state machine
    async fn abort_session(&self, file_id: &FileId, reason: String) {
        match self.registry.abort(file_id).await {
            Ok(_) => self.discard(file_id, FileStatus::Aborted, reason).await,
            Err(e) => debug!(file_id = %file_id, "session already gone: {}", e),
        }
    }
}

/// Compare a client-declared SHA-256 (hex, optionally `sha256:`-prefixed) with the payload
fn checksum_matches(declared: &str, payload: &[u8]) -> bool {
    let declared = declared.trim();
    let declared = declared.strip_prefix("sha256:").unwrap_or(declared);
    hex::encode(Sha256::digest(payload)).eq_ignore_ascii_case(declared)
}

#[async_trait]
impl UploadCoordinator for DefaultUploadCoordinator {
    async fn initiate(&self, ctx: FilesCtx, request: InitiateUpload) -> FilesResult<UploadTicket> {
        ctx.authorize()?;
        let layout = self.check_initiate(&request)?;

        let file_id = FileId::new();
        let name = sanitize_name(&request.name, file_id.as_str());
        let extension = extension_of(&name);
        if let Some(allowed) = &self.config.upload_rules.allowed_extensions {
            if !allowed.iter().any(|ext| ext == &extension) {
                return Err(FilesError::invalid_metadata(format!(
                    "extension {:?} is not allowed",
                    extension
                )));
            }
        }

        let session = self
            .registry
            .initiate(file_id.clone(), layout.total_size, layout.chunk_size, ctx.principal.clone())
            .await?;

        let allocated = self
            .with_retries("allocate", &file_id, || {
                self.store.allocate(&file_id, layout.total_size)
            })
            .await;
        let handle = match allocated {
            Ok(handle) => handle,
            Err(e) => {
                self.close_session(&file_id, FileStatus::Aborted).await;
                return Err(e);
            }
        };

        let now = Utc::now();
        let declared_mime = request
            .mime
            .map(|mime| mime.trim().to_string())
            .filter(|mime| !mime.is_empty());
        let mut record = FileRecord {
            id: file_id.clone(),
            name,
            extension,
            size: layout.total_size,
            chunk_size: layout.chunk_size,
            declared_mime,
            mime: String::new(),
            owner: ctx.principal.clone(),
            metadata: request.metadata,
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
        };
        // Provisional until finalize sniffs the content.
        let provisional = resolve_mime(None, record.declared_mime.as_deref(), &record.extension);
        record.apply_mime(provisional);

        if let Err(e) = self.catalog.insert(record).await {
            self.close_session(&file_id, FileStatus::Aborted).await;
            if let Err(cleanup) = self.store.delete(&handle).await {
                warn!(file_id = %file_id, "failed to delete blob after record insert failed: {}", cleanup);
            }
            return Err(e);
        }

        info!(
            file_id = %file_id,
            size = layout.total_size,
            chunk_size = layout.chunk_size,
            total_chunks = layout.total_chunks,
            "upload initiated"
        );
        self.events.publish(FileEvent::Initiated {
            file_id: file_id.clone(),
            total_chunks: layout.total_chunks,
            at: now,
        });

        Ok(UploadTicket {
            file_id,
            token: session.token,
            chunk_size: layout.chunk_size,
            total_chunks: layout.total_chunks,
        })
    }

    async fn upload_chunk(&self, ctx: FilesCtx, request: ChunkWriteRequest) -> FilesResult<ChunkAck> {
        ctx.authorize()?;
        let ChunkWriteRequest {
            file_id,
            index,
            offset,
            payload,
            checksum,
        } = request;

        let layout = match self.registry.layout(&file_id).await {
            Ok(layout) => layout,
            Err(FilesError::NotFound { .. }) => return self.ack_without_session(&file_id, index).await,
            Err(e) => return Err(e),
        };
        let len = payload.len() as u64;
        Self::check_geometry(&layout, index, offset, len)?;

        if let Some(declared) = checksum.as_deref() {
            if !checksum_matches(declared, &payload) {
                let count = self.registry.record_corrupt(&file_id).await?;
                warn!(file_id = %file_id, chunk = index, corrupt = count, "chunk checksum mismatch");
                if count > self.config.max_corrupt_chunks {
                    let e = FilesError::CorruptionBudgetExceeded {
                        id: file_id.to_string(),
                        count,
                    };
                    self.abort_session(&file_id, e.to_string()).await;
                    return Err(e);
                }
                return Err(FilesError::ChunkCorrupt {
                    id: file_id.to_string(),
                    index,
                });
            }
        }

        let guard = self.chunk_locks.lock((file_id.clone(), index)).await;
        let claim = match self.registry.begin_chunk(&file_id, index).await {
            Ok(claim) => claim,
            // Finalized by a concurrent delivery while this one waited for the lock.
            Err(FilesError::NotFound { .. }) => return self.ack_without_session(&file_id, index).await,
            Err(e) => return Err(e),
        };
        match claim {
            ChunkClaim::Fresh => {}
            ChunkClaim::AlreadyReceived => {
                debug!(file_id = %file_id, chunk = index, "duplicate chunk ignored");
                let received_chunks = self
                    .registry
                    .received_chunks(&file_id)
                    .await
                    .unwrap_or(layout.total_chunks);
                return Ok(ChunkAck {
                    accepted: true,
                    already_received: true,
                    complete: false,
                    received_chunks,
                    total_chunks: layout.total_chunks,
                });
            }
            ChunkClaim::InFlight => {
                return Err(FilesError::ChunkInFlight {
                    id: file_id.to_string(),
                    index,
                })
            }
        }

        let handle = BlobHandle::new(file_id.clone(), layout.total_size);
        let written = self
            .with_retries("write_chunk", &file_id, || {
                self.store.write_chunk(&handle, offset, payload.clone())
            })
            .await
            .map_err(|e| e.or_capacity(payload.len() as u64));
        if let Err(e) = written {
            self.registry.release_chunk(&file_id, index).await;
            if e.is_fatal_to_session() {
                self.abort_session(&file_id, e.to_string()).await;
                return Err(e);
            }
            if matches!(e, FilesError::NotFound { .. }) {
                return Err(self.gone_error(&file_id).await);
            }
            warn!(file_id = %file_id, chunk = index, "chunk write failed: {}", e);
            return Err(e);
        }

        let commit = match self.registry.commit_chunk(&file_id, index, len).await {
            Ok(commit) => commit,
            Err(FilesError::NotFound { .. }) => return Err(self.gone_error(&file_id).await),
            Err(e) => return Err(e),
        };
        drop(guard);

        debug!(
            file_id = %file_id,
            chunk = index,
            received = commit.received_chunks,
            total = commit.total_chunks,
            "chunk committed"
        );

        // Exactly one commit observes the first received chunk.
        if commit.received_chunks == 1 {
            if let Err(e) = self
                .catalog
                .transition(&file_id, &[FileStatus::Initiated], FileStatus::InProgress, |_| {})
                .await
            {
                warn!(file_id = %file_id, "failed to mark upload in progress: {}", e);
            }
        }
        self.events.publish(FileEvent::ChunkReceived {
            file_id: file_id.clone(),
            index,
            received_chunks: commit.received_chunks,
            total_chunks: commit.total_chunks,
            at: Utc::now(),
        });

        if commit.completed {
            self.finalize(&file_id, &layout).await?;
        }

        Ok(ChunkAck {
            accepted: true,
            already_received: false,
            complete: commit.completed,
            received_chunks: commit.received_chunks,
            total_chunks: commit.total_chunks,
        })
    }

    async fn abort(&self, ctx: FilesCtx, file_id: &FileId) -> FilesResult<()> {
        ctx.authorize()?;
        match self.registry.abort(file_id).await {
            Ok(_) => {
                self.discard(file_id, FileStatus::Aborted, "aborted by request".to_string())
                    .await;
                Ok(())
            }
            Err(FilesError::NotFound { .. }) => {
                let record = self.catalog.get(file_id).await?;
                match record.status {
                    FileStatus::Aborted => Ok(()),
                    FileStatus::Expired => Err(FilesError::SessionExpired {
                        id: file_id.to_string(),
                    }),
                    FileStatus::Complete => Err(FilesError::invalid(format!(
                        "upload {} is already complete",
                        file_id
                    ))),
                    _ => Err(FilesError::not_found(file_id.as_str())),
                }
            }
            Err(FilesError::SessionAborted { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn resume(&self, ctx: FilesCtx, file_id: &FileId, token: &str) -> FilesResult<UploadProgress> {
        ctx.authorize()?;
        match self.registry.snapshot(file_id).await {
            Ok(session) => {
                if !session.token.matches(token) {
                    return Err(FilesError::InvalidToken {
                        id: file_id.to_string(),
                    });
                }
                let status = self.catalog.get(file_id).await?.status;
                Ok(UploadProgress::from_session(&session, status))
            }
            Err(FilesError::NotFound { .. }) => {
                let record = self.catalog.get(file_id).await?;
                match record.status {
                    FileStatus::Complete => Ok(UploadProgress::finished(&record)),
                    FileStatus::Expired => Err(FilesError::SessionExpired {
                        id: file_id.to_string(),
                    }),
                    FileStatus::Aborted => Err(FilesError::SessionAborted {
                        id: file_id.to_string(),
                    }),
                    _ => Err(FilesError::not_found(file_id.as_str())),
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn delete(&self, ctx: FilesCtx, file_id: &FileId) -> FilesResult<()> {
        ctx.authorize()?;
        let record = self.catalog.get(file_id).await?;
        if record.status.is_active() {
            match self.registry.abort(file_id).await {
                Ok(_) | Err(FilesError::NotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        let handle = BlobHandle::new(file_id.clone(), record.size);
        self.with_retries("delete", file_id, || self.store.delete(&handle))
            .await?;
        self.catalog.remove(file_id).await?;

        info!(file_id = %file_id, "file deleted");
        self.events.publish(FileEvent::Deleted {
            file_id: file_id.clone(),
            at: Utc::now(),
        });
        Ok(())
    }

    async fn expire_stale(&self, now: DateTime<Utc>) -> FilesResult<Vec<FileId>> {
        let expired = self.registry.expire_stale(now).await;
        for file_id in &expired {
            self.discard(file_id, FileStatus::Expired, "session expired".to_string())
                .await;
        }
        Ok(expired)
    }

    async fn recover(&self) -> FilesResult<usize> {
        let restored = self.registry.restore().await?;

        for file_id in &restored {
            let Some(record) = self.catalog.find(file_id).await? else {
                // Initiation stopped before the record was written.
                warn!(file_id = %file_id, "session without a record, dropping it");
                self.close_session(file_id, FileStatus::Aborted).await;
                self.delete_blob(file_id).await;
                continue;
            };

            match record.status {
                FileStatus::Complete => {
                    debug!(file_id = %file_id, "dropping session of a completed upload");
                    self.close_session(file_id, FileStatus::Complete).await;
                }
                FileStatus::Aborted | FileStatus::Expired => {
                    debug!(file_id = %file_id, "dropping session of a {} upload", record.status.as_str());
                    self.close_session(file_id, record.status).await;
                    self.delete_blob(file_id).await;
                }
                FileStatus::Initiated | FileStatus::InProgress => {
                    match self.registry.claim_recovery(file_id).await {
                        Ok(Some(layout)) => {
                            info!(file_id = %file_id, "finishing upload interrupted before finalize");
                            if let Err(e) = self.finalize(file_id, &layout).await {
                                warn!(file_id = %file_id, "recovered finalize failed: {}", e);
                            }
                        }
                        Ok(None) => {}
                        Err(e) => warn!(file_id = %file_id, "session closed during recovery: {}", e),
                    }
                }
            }
        }

        Ok(restored.len())
    }
}
