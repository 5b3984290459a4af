//! # dog-files: Chunked, resumable file uploads with range-friendly downloads
//!
//! `dog-files` accepts large files as independently delivered chunks, tolerates retries,
//! duplicates and out-of-order arrival, and finalizes every file exactly once. Completed
//! files are served as whole bodies, single ranges or multipart byte ranges.
//!
//! ## Key Features
//!
//! - **Resumable uploads**: Clients ask which chunks are missing and send only those
//! - **Exactly-once completion**: Concurrent final chunks race safely; one caller sees `complete`
//! - **Idempotent chunks**: Re-sending a chunk is acknowledged without a second write
//! - **Range requests**: `Range` headers resolve to 200, 206 or multipart/byteranges responses
//! - **Storage agnostic**: Filesystem and in-memory stores ship with the crate; bring your own
//! - **Server agnostic**: No HTTP coupling; bindings map [`FilesError::status_code`] to responses
//!
//! ## Quick Start
//!
//! ```rust
//! use dog_files::prelude::*;
//! use bytes::Bytes;
//!
//! # #[tokio::main]
//! # async fn main() -> FilesResult<()> {
//! // 1. Create an adapter over a chunk store
//! let adapter = FilesAdapter::new(MemoryChunkStore::new(), FilesConfig::default())?;
//!
//! // 2. Context for the calling principal
//! let ctx = FilesCtx::new("user-123");
//!
//! // 3. Initiate and deliver chunks in any order
//! let ticket = adapter
//!     .initiate_upload(ctx.clone(), InitiateUpload::new("hello.txt", 13).with_chunk_size(8))
//!     .await?;
//! let id = ticket.file_id.clone();
//! adapter
//!     .upload_chunk(ctx.clone(), ChunkWriteRequest::new(id.clone(), 1, 8, Bytes::from_static(b"orld!")))
//!     .await?;
//! let ack = adapter
//!     .upload_chunk(ctx.clone(), ChunkWriteRequest::new(id.clone(), 0, 0, Bytes::from_static(b"Hello, w")))
//!     .await?;
//! assert!(ack.complete);
//!
//! // 4. Download with range support
//! let download = adapter
//!     .open_download(ctx, &id, DownloadOptions::new().with_range("bytes=0-4"))
//!     .await?;
//! assert_eq!(download.status, 206);
//! assert_eq!(download.content_range.as_deref(), Some("bytes 0-4/13"));
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────┐
//! │             Your Service              │  ← Transport binding
//! ├───────────────────────────────────────┤
//! │             FilesAdapter              │  ← Authorization, wiring
//! ├───────────────────┬───────────────────┤
//! │ UploadCoordinator │   RangeStreamer   │  ← State machine, reads
//! ├───────────────────┴───────────────────┤
//! │ SessionRegistry │ MetadataCatalog     │  ← Chunk claims, records
//! ├───────────────────────────────────────┤
//! │              ChunkStore               │  ← Durable bytes
//! └───────────────────────────────────────┘
//! ```
//!
//! Abandoned sessions are reclaimed by an [`ExpirySweeper`], started with
//! [`FilesAdapter::spawn_sweeper`]. State transitions are published on an [`EventBus`].

pub mod adapter;
mod bitmap;
pub mod catalog;
mod config;
pub mod coordinator;
mod error;
pub mod events;
mod fs_store;
mod keyed_mutex;
mod memory_store;
pub mod record;
pub mod registry;
pub mod sniff;
pub mod store;
pub mod streamer;
mod sweeper;
mod types;

// Re-export main types for clean API
pub use adapter::{FilesAdapter, FilesAdapterBuilder};
pub use bitmap::CoverageBitmap;
pub use catalog::MetadataCatalog;
pub use config::{FilesConfig, UploadRules, ENV_PREFIX};
pub use coordinator::{DefaultUploadCoordinator, UploadCoordinator};
pub use error::{ErrorClass, FilesError, FilesResult};
pub use events::{EventBus, FileEvent};
pub use fs_store::FsChunkStore;
pub use keyed_mutex::{KeyedGuard, KeyedMutex};
pub use memory_store::MemoryChunkStore;
pub use record::{JsonDirRecordStore, MemoryRecordStore, RecordStore};
pub use registry::{ChunkClaim, ChunkCommit, SessionRegistry};
pub use store::{BlobHandle, ChunkStore};
pub use streamer::{Download, DownloadOptions, RangeReader, RangeStreamer, ResolvedRange};
pub use sweeper::ExpirySweeper;
pub use types::{
    extension_of, sanitize_name, Access, ByteRange, ByteStream, ChunkAck, ChunkLayout,
    ChunkWriteRequest, FileId, FileMetadata, FileRecord, FileStatus, FilesCtx, InitiateUpload,
    RangeSpec, SessionToken, UploadProgress, UploadSession, UploadTicket,
};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::{
        ChunkAck, ChunkStore, ChunkWriteRequest, Download, DownloadOptions, FileId, FileRecord,
        FileStatus, FilesAdapter, FilesConfig, FilesCtx, FilesError, FilesResult, FsChunkStore,
        InitiateUpload, MemoryChunkStore, RangeSpec,
    };
}
