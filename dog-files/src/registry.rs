use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::record::RecordStore;
use crate::{ChunkLayout, FileId, FileStatus, FilesError, FilesResult, UploadProgress, UploadSession};

/// Result of trying to claim a chunk slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkClaim {
    /// The caller owns the slot and must commit or release it
    Fresh,
    /// The chunk is already durably received; nothing to do
    AlreadyReceived,
    /// Another request holds the slot
    InFlight,
}

/// Result of committing a claimed chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkCommit {
    /// True for exactly one commit per session: the one that set the final bit
    pub completed: bool,
    pub received_chunks: u64,
    pub total_chunks: u64,
}

struct SessionState {
    session: UploadSession,
    in_flight: HashSet<u64>,
    finalizing: bool,
    /// Set once the session has left the registry
    closed: Option<FileStatus>,
}

type Slot = Arc<Mutex<SessionState>>;

/// Single source of truth for chunk-arrival bookkeeping.
///
/// Each session sits behind its own async mutex, so claims on one file never wait on
/// another. Snapshots are written to the backing record store on initiation and on every
/// committed chunk, and removed when the session ends.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<FileId, Slot>>,
    store: Arc<dyn RecordStore<UploadSession>>,
    timeout: Duration,
}

impl SessionRegistry {
    pub fn new(store: Arc<dyn RecordStore<UploadSession>>, timeout: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            store,
            timeout,
        }
    }

    /// Register a new upload session
    pub async fn initiate(
        &self,
        file_id: FileId,
        total_size: u64,
        chunk_size: u64,
        owner: Option<String>,
    ) -> FilesResult<UploadSession> {
        let session = UploadSession::new(file_id.clone(), total_size, chunk_size)?.with_owner(owner);

        {
            let mut sessions = self.sessions.write();
            if sessions.contains_key(&file_id) {
                return Err(FilesError::DuplicateSession {
                    id: file_id.to_string(),
                });
            }
            sessions.insert(
                file_id.clone(),
                Arc::new(Mutex::new(SessionState {
                    session: session.clone(),
                    in_flight: HashSet::new(),
                    finalizing: false,
                    closed: None,
                })),
            );
        }

        if let Err(e) = self.store.upsert(&file_id, &session).await {
            self.sessions.write().remove(&file_id);
            return Err(e);
        }

        debug!(file_id = %file_id, total_chunks = session.total_chunks, "session registered");
        Ok(session)
    }

    fn slot(&self, file_id: &FileId) -> FilesResult<Slot> {
        self.sessions
            .read()
            .get(file_id)
            .cloned()
            .ok_or_else(|| FilesError::not_found(file_id.as_str()))
    }

    pub fn contains(&self, file_id: &FileId) -> bool {
        self.sessions.read().contains_key(file_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    pub fn active_ids(&self) -> Vec<FileId> {
        self.sessions.read().keys().cloned().collect()
    }

    /// Atomically move chunk `index` from missing to in-flight
    pub async fn begin_chunk(&self, file_id: &FileId, index: u64) -> FilesResult<ChunkClaim> {
        let slot = self.slot(file_id)?;
        let mut state = slot.lock().await;

        match state.closed {
            Some(FileStatus::Complete) => return Ok(ChunkClaim::AlreadyReceived),
            Some(status) => return Err(closed_error(file_id, status)),
            None => {}
        }
        if index >= state.session.total_chunks {
            return Err(FilesError::out_of_bounds(
                index,
                format!("upload has {} chunks", state.session.total_chunks),
            ));
        }
        if state.session.received.contains(index) {
            return Ok(ChunkClaim::AlreadyReceived);
        }
        if !state.in_flight.insert(index) {
            return Ok(ChunkClaim::InFlight);
        }

        state.session.last_activity = Utc::now();
        Ok(ChunkClaim::Fresh)
    }

    /// Move a claimed chunk to received and count its bytes
    pub async fn commit_chunk(&self, file_id: &FileId, index: u64, len: u64) -> FilesResult<ChunkCommit> {
        let slot = self.slot(file_id)?;
        let mut state = slot.lock().await;

        state.in_flight.remove(&index);
        if let Some(status) = state.closed {
            return Err(closed_error(file_id, status));
        }

        let received_bytes = state.session.received_bytes.saturating_add(len);
        if received_bytes > state.session.total_size {
            return Err(FilesError::size_mismatch(format!(
                "{} bytes received exceeds declared size {}",
                received_bytes, state.session.total_size
            )));
        }
        if !state.session.received.test_and_set(index) {
            // Already counted; the caller lost a race it should not have been in.
            return Ok(ChunkCommit {
                completed: false,
                received_chunks: state.session.received.count(),
                total_chunks: state.session.total_chunks,
            });
        }

        state.session.received_bytes = received_bytes;
        state.session.last_activity = Utc::now();

        let completed = state.session.is_complete() && !state.finalizing;
        if completed {
            state.finalizing = true;
        }

        // Persist under the slot lock so snapshots are written in commit order.
        if let Err(e) = self.store.upsert(file_id, &state.session).await {
            warn!(file_id = %file_id, chunk = index, "failed to persist session snapshot: {}", e);
        }

        Ok(ChunkCommit {
            completed,
            received_chunks: state.session.received.count(),
            total_chunks: state.session.total_chunks,
        })
    }

    /// Return a failed claim to missing
    pub async fn release_chunk(&self, file_id: &FileId, index: u64) {
        if let Ok(slot) = self.slot(file_id) {
            slot.lock().await.in_flight.remove(&index);
        }
    }

    /// Count a checksum failure; returns the session total
    pub async fn record_corrupt(&self, file_id: &FileId) -> FilesResult<u32> {
        let slot = self.slot(file_id)?;
        let mut state = slot.lock().await;
        if let Some(status) = state.closed {
            return Err(closed_error(file_id, status));
        }
        state.session.corrupt_chunks = state.session.corrupt_chunks.saturating_add(1);
        state.session.last_activity = Utc::now();
        Ok(state.session.corrupt_chunks)
    }

    pub async fn is_complete(&self, file_id: &FileId) -> FilesResult<bool> {
        let slot = self.slot(file_id)?;
        let state = slot.lock().await;
        Ok(state.session.is_complete())
    }

    /// Copy of the session as it stands
    pub async fn snapshot(&self, file_id: &FileId) -> FilesResult<UploadSession> {
        let slot = self.slot(file_id)?;
        let state = slot.lock().await;
        Ok(state.session.clone())
    }

    pub async fn progress(&self, file_id: &FileId, status: FileStatus) -> FilesResult<UploadProgress> {
        let slot = self.slot(file_id)?;
        let state = slot.lock().await;
        Ok(UploadProgress::from_session(&state.session, status))
    }

    /// Chunk geometry of an active session
    pub async fn layout(&self, file_id: &FileId) -> FilesResult<ChunkLayout> {
        let slot = self.slot(file_id)?;
        let state = slot.lock().await;
        if let Some(status) = state.closed {
            return Err(closed_error(file_id, status));
        }
        Ok(state.session.layout())
    }

    pub async fn received_chunks(&self, file_id: &FileId) -> FilesResult<u64> {
        let slot = self.slot(file_id)?;
        let state = slot.lock().await;
        Ok(state.session.received.count())
    }

    /// Bytes readable from the start of the blob, `None` without an active session
    pub async fn contiguous_bytes(&self, file_id: &FileId) -> Option<u64> {
        let slot = self.slot(file_id).ok()?;
        let state = slot.lock().await;
        if state.closed.is_some() {
            return None;
        }
        Some(state.session.contiguous_bytes())
    }

    /// Explicit abort. Refused while the session is being finalized.
    pub async fn abort(&self, file_id: &FileId) -> FilesResult<UploadSession> {
        let slot = self.slot(file_id)?;
        let mut state = slot.lock().await;
        if let Some(status) = state.closed {
            return Err(closed_error(file_id, status));
        }
        if state.finalizing {
            return Err(FilesError::Finalizing {
                id: file_id.to_string(),
            });
        }
        state.closed = Some(FileStatus::Aborted);
        self.evict(file_id).await;
        Ok(state.session.clone())
    }

    /// End a session with a terminal status, whether or not it is finalizing
    pub async fn close(&self, file_id: &FileId, status: FileStatus) -> FilesResult<UploadSession> {
        let slot = self.slot(file_id)?;
        let mut state = slot.lock().await;
        if let Some(closed) = state.closed {
            return Err(closed_error(file_id, closed));
        }
        state.closed = Some(status);
        self.evict(file_id).await;
        Ok(state.session.clone())
    }

    /// Close every session idle for longer than the timeout; finalizing sessions are skipped
    pub async fn expire_stale(&self, now: DateTime<Utc>) -> Vec<FileId> {
        let timeout = chrono::Duration::from_std(self.timeout).unwrap_or(chrono::Duration::MAX);
        let slots: Vec<(FileId, Slot)> = self
            .sessions
            .read()
            .iter()
            .map(|(id, slot)| (id.clone(), slot.clone()))
            .collect();

        let mut expired = Vec::new();
        for (file_id, slot) in slots {
            let mut state = slot.lock().await;
            if state.closed.is_some() || state.finalizing || !state.in_flight.is_empty() {
                continue;
            }
            if now.signed_duration_since(state.session.last_activity) <= timeout {
                continue;
            }
            state.closed = Some(FileStatus::Expired);
            self.evict(&file_id).await;
            expired.push(file_id);
        }
        expired
    }

    /// Reload persisted sessions, returning the ids that were added
    pub async fn restore(&self) -> FilesResult<Vec<FileId>> {
        let persisted = self.store.list().await?;
        let mut restored = Vec::new();
        let mut sessions = self.sessions.write();
        for session in persisted {
            if sessions.contains_key(&session.file_id) {
                continue;
            }
            restored.push(session.file_id.clone());
            sessions.insert(
                session.file_id.clone(),
                Arc::new(Mutex::new(SessionState {
                    session,
                    in_flight: HashSet::new(),
                    finalizing: false,
                    closed: None,
                })),
            );
        }
        if !restored.is_empty() {
            info!("Restored {} upload sessions", restored.len());
        }
        Ok(restored)
    }

    /// Take over finalization of a session that already holds every chunk.
    ///
    /// A snapshot with all bits set but no finalized blob means the process stopped
    /// between the last commit and finalize. Returns the layout when the caller now owns
    /// finalization, `None` when chunks are missing or another caller already owns it.
    pub async fn claim_recovery(&self, file_id: &FileId) -> FilesResult<Option<ChunkLayout>> {
        let slot = self.slot(file_id)?;
        let mut state = slot.lock().await;
        if let Some(status) = state.closed {
            return Err(closed_error(file_id, status));
        }
        if state.finalizing || !state.session.is_complete() {
            return Ok(None);
        }
        state.finalizing = true;
        Ok(Some(state.session.layout()))
    }

    /// Drop the map entry and the persisted snapshot; caller holds the slot lock
    async fn evict(&self, file_id: &FileId) {
        self.sessions.write().remove(file_id);
        if let Err(e) = self.store.remove(file_id).await {
            warn!(file_id = %file_id, "failed to remove session snapshot: {}", e);
        }
    }
}

fn closed_error(file_id: &FileId, status: FileStatus) -> FilesError {
    match status {
        FileStatus::Expired => FilesError::SessionExpired {
            id: file_id.to_string(),
        },
        FileStatus::Aborted => FilesError::SessionAborted {
            id: file_id.to_string(),
        },
        _ => FilesError::not_found(file_id.as_str()),
    }
}
