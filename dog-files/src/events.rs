use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::FileId;

/// State-transition events emitted by the upload state machine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FileEvent {
    /// Upload session created
    Initiated {
        file_id: FileId,
        total_chunks: u64,
        at: DateTime<Utc>,
    },

    /// A chunk was durably received
    ChunkReceived {
        file_id: FileId,
        index: u64,
        received_chunks: u64,
        total_chunks: u64,
        at: DateTime<Utc>,
    },

    /// Upload finalized and readable
    Completed {
        file_id: FileId,
        size: u64,
        mime: String,
        at: DateTime<Utc>,
    },

    /// Upload abandoned; its blob is gone
    Aborted {
        file_id: FileId,
        reason: String,
        at: DateTime<Utc>,
    },

    /// Session timed out and was swept
    Expired {
        file_id: FileId,
        at: DateTime<Utc>,
    },

    /// File removed on request
    Deleted {
        file_id: FileId,
        at: DateTime<Utc>,
    },
}

impl FileEvent {
    /// Get event type name as string
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Initiated { .. } => "initiated",
            Self::ChunkReceived { .. } => "chunk_received",
            Self::Completed { .. } => "completed",
            Self::Aborted { .. } => "aborted",
            Self::Expired { .. } => "expired",
            Self::Deleted { .. } => "deleted",
        }
    }

    pub fn file_id(&self) -> &FileId {
        match self {
            Self::Initiated { file_id, .. }
            | Self::ChunkReceived { file_id, .. }
            | Self::Completed { file_id, .. }
            | Self::Aborted { file_id, .. }
            | Self::Expired { file_id, .. }
            | Self::Deleted { file_id, .. } => file_id,
        }
    }

    pub fn timestamp(&self) -> &DateTime<Utc> {
        match self {
            Self::Initiated { at, .. }
            | Self::ChunkReceived { at, .. }
            | Self::Completed { at, .. }
            | Self::Aborted { at, .. }
            | Self::Expired { at, .. }
            | Self::Deleted { at, .. } => at,
        }
    }

    /// True for events after which the file accepts no more chunks
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed { .. } | Self::Aborted { .. } | Self::Expired { .. } | Self::Deleted { .. }
        )
    }
}

/// Broadcast channel for [`FileEvent`]s. Publishing never fails: with no subscribers,
/// or with lagging ones, events are dropped.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<FileEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn publish(&self, event: FileEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> BroadcastStream<FileEvent> {
        BroadcastStream::new(self.sender.subscribe())
    }
}
