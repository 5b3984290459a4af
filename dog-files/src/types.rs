use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_core::Stream;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::pin::Pin;
use uuid::Uuid;

use crate::{CoverageBitmap, FilesError, FilesResult};

/// Stream of bytes for file content
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Send>>;

/// Unique identifier for a file, assigned at upload initiation
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileId(pub String);

impl FileId {
    /// Generate a new random file ID
    pub fn new() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Create from existing string
    pub fn from_string(id: String) -> Self {
        Self(id)
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True when the id is safe to use as a single path component
    pub fn is_path_safe(&self) -> bool {
        !self.0.is_empty()
            && self.0.len() <= 128
            && self
                .0
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    }
}

impl Default for FileId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for FileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for FileId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Opaque token handed out at initiation; required to resume an upload
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionToken(String);

impl SessionToken {
    /// 32 random bytes, URL-safe base64
    pub fn generate() -> Self {
        let mut raw = [0u8; 32];
        raw[..16].copy_from_slice(Uuid::new_v4().as_bytes());
        raw[16..].copy_from_slice(Uuid::new_v4().as_bytes());
        Self(URL_SAFE_NO_PAD.encode(raw))
    }

    pub fn from_string(token: String) -> Self {
        Self(token)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Constant-time comparison
    pub fn matches(&self, candidate: &str) -> bool {
        let ours = self.0.as_bytes();
        let theirs = candidate.as_bytes();
        if ours.len() != theirs.len() {
            return false;
        }
        ours.iter()
            .zip(theirs)
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

impl std::fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionToken(..)")
    }
}

/// External permission decision for the current request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Granted,
    Denied,
}

/// Context for file operations (principal, permission decision, request info)
#[derive(Debug, Clone)]
pub struct FilesCtx {
    pub principal: Option<String>,
    pub access: Access,
    pub request_id: String,
}

impl FilesCtx {
    pub fn new<S: Into<String>>(principal: S) -> Self {
        Self {
            principal: Some(principal.into()),
            access: Access::Granted,
            request_id: Uuid::new_v4().to_string(),
        }
    }

    pub fn anonymous() -> Self {
        Self {
            principal: None,
            access: Access::Granted,
            request_id: Uuid::new_v4().to_string(),
        }
    }

    pub fn with_access(mut self, access: Access) -> Self {
        self.access = access;
        self
    }

    pub fn with_request_id(mut self, request_id: String) -> Self {
        self.request_id = request_id;
        self
    }

    pub fn authorize(&self) -> FilesResult<()> {
        match self.access {
            Access::Granted => Ok(()),
            Access::Denied => Err(FilesError::Forbidden),
        }
    }
}

/// Lifecycle status of a file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileStatus {
    Initiated,
    InProgress,
    Complete,
    Aborted,
    Expired,
}

impl FileStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Aborted | Self::Expired)
    }

    /// Still accepting chunks
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Initiated | Self::InProgress)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initiated => "initiated",
            Self::InProgress => "in_progress",
            Self::Complete => "complete",
            Self::Aborted => "aborted",
            Self::Expired => "expired",
        }
    }
}

const MAX_TITLE: usize = 256;
const MAX_DESCRIPTION: usize = 4096;
const MAX_TAGS: usize = 32;
const MAX_TAG_LEN: usize = 64;
const MAX_EXTRA_KEYS: usize = 64;
const MAX_EXTRA_KEY_LEN: usize = 64;
const RESERVED_KEYS: [&str; 4] = ["title", "description", "tags", "public"];

/// Descriptive metadata: a closed set of fields plus an open extension map
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub title: Option<String>,
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub public: bool,
    #[serde(default)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl FileMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_title<S: Into<String>>(mut self, title: S) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_description<S: Into<String>>(mut self, description: S) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_tag<S: Into<String>>(mut self, tag: S) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn public(mut self) -> Self {
        self.public = true;
        self
    }

    pub fn with_extra<K: Into<String>, V: Serialize>(mut self, key: K, value: V) -> Self {
        self.extra.insert(
            key.into(),
            serde_json::to_value(value).unwrap_or(serde_json::Value::Null),
        );
        self
    }

    /// Validate against the schema limits
    pub fn validate(&self) -> FilesResult<()> {
        if let Some(title) = &self.title {
            if title.chars().count() > MAX_TITLE {
                return Err(FilesError::invalid_metadata(format!(
                    "title longer than {} characters",
                    MAX_TITLE
                )));
            }
        }
        if let Some(description) = &self.description {
            if description.chars().count() > MAX_DESCRIPTION {
                return Err(FilesError::invalid_metadata(format!(
                    "description longer than {} characters",
                    MAX_DESCRIPTION
                )));
            }
        }
        if self.tags.len() > MAX_TAGS {
            return Err(FilesError::invalid_metadata(format!(
                "more than {} tags",
                MAX_TAGS
            )));
        }
        for tag in &self.tags {
            let len = tag.chars().count();
            if len == 0 || len > MAX_TAG_LEN {
                return Err(FilesError::invalid_metadata(format!(
                    "tag {:?} must be 1-{} characters",
                    tag, MAX_TAG_LEN
                )));
            }
        }
        if self.extra.len() > MAX_EXTRA_KEYS {
            return Err(FilesError::invalid_metadata(format!(
                "more than {} extra fields",
                MAX_EXTRA_KEYS
            )));
        }
        for key in self.extra.keys() {
            if key.is_empty()
                || key.len() > MAX_EXTRA_KEY_LEN
                || !key
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
            {
                return Err(FilesError::invalid_metadata(format!(
                    "invalid extra field name {:?}",
                    key
                )));
            }
            if RESERVED_KEYS.contains(&key.as_str()) {
                return Err(FilesError::invalid_metadata(format!(
                    "extra field {:?} shadows a built-in field",
                    key
                )));
            }
        }
        Ok(())
    }
}

/// Descriptive record of a file, owned by the metadata catalog
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: FileId,
    pub name: String,
    pub extension: String,
    /// Declared total size; authoritative once complete
    pub size: u64,
    pub chunk_size: u64,
    pub declared_mime: Option<String>,
    /// Resolved MIME type; authoritative once complete
    pub mime: String,
    pub owner: Option<String>,
    pub metadata: FileMetadata,
    pub status: FileStatus,
    pub checksum: Option<String>,
    pub is_video: bool,
    pub is_audio: bool,
    pub is_image: bool,
    pub is_text: bool,
    pub is_json: bool,
    pub is_pdf: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl FileRecord {
    /// Whether `principal` may see this record in listings
    pub fn is_owned_by(&self, principal: Option<&str>) -> bool {
        match (&self.owner, principal) {
            (Some(owner), Some(principal)) => owner == principal,
            (None, None) => true,
            _ => false,
        }
    }

    /// Set the resolved MIME type and the media flags derived from it
    pub fn apply_mime<S: Into<String>>(&mut self, mime: S) {
        let mime = mime.into();
        let essence = mime
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        self.is_video = essence.starts_with("video/");
        self.is_audio = essence.starts_with("audio/");
        self.is_image = essence.starts_with("image/");
        self.is_json = essence == "application/json" || essence.ends_with("+json");
        self.is_text = essence.starts_with("text/") || self.is_json;
        self.is_pdf = essence == "application/pdf";
        self.mime = mime;
    }
}

/// Replace path separators and control characters; empty names fall back to `fallback`
pub fn sanitize_name(name: &str, fallback: &str) -> String {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|c| {
            if c == '/' || c == '\\' || c.is_control() {
                '_'
            } else {
                c
            }
        })
        .collect();
    let cleaned = cleaned.trim_matches('.').to_string();
    if cleaned.is_empty() {
        fallback.to_string()
    } else {
        cleaned
    }
}

/// Lower-case text after the last dot, empty when there is none
pub fn extension_of(name: &str) -> String {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => ext.to_lowercase(),
        _ => String::new(),
    }
}

/// How a declared size splits into fixed-size chunks; only the last chunk may be short
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkLayout {
    pub total_size: u64,
    pub chunk_size: u64,
    pub total_chunks: u64,
}

impl ChunkLayout {
    pub fn new(total_size: u64, chunk_size: u64) -> FilesResult<Self> {
        if total_size == 0 {
            return Err(FilesError::invalid_size("total size must be greater than zero"));
        }
        if chunk_size == 0 {
            return Err(FilesError::invalid_size("chunk size must be greater than zero"));
        }
        Ok(Self {
            total_size,
            chunk_size,
            total_chunks: total_size.div_ceil(chunk_size),
        })
    }

    /// Byte offset where chunk `index` starts
    pub fn offset_of(&self, index: u64) -> u64 {
        index.saturating_mul(self.chunk_size)
    }

    /// Exact length chunk `index` must have
    pub fn expected_len(&self, index: u64) -> u64 {
        let offset = self.offset_of(index);
        self.chunk_size.min(self.total_size.saturating_sub(offset))
    }
}

/// Bookkeeping for one in-flight upload; persisted on every committed chunk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadSession {
    pub file_id: FileId,
    pub owner: Option<String>,
    pub token: SessionToken,
    pub total_size: u64,
    pub chunk_size: u64,
    pub total_chunks: u64,
    pub received: CoverageBitmap,
    pub received_bytes: u64,
    pub corrupt_chunks: u32,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl UploadSession {
    pub fn new(file_id: FileId, total_size: u64, chunk_size: u64) -> FilesResult<Self> {
        let layout = ChunkLayout::new(total_size, chunk_size)?;
        let now = Utc::now();
        Ok(Self {
            file_id,
            owner: None,
            token: SessionToken::generate(),
            total_size,
            chunk_size,
            total_chunks: layout.total_chunks,
            received: CoverageBitmap::new(layout.total_chunks),
            received_bytes: 0,
            corrupt_chunks: 0,
            created_at: now,
            last_activity: now,
        })
    }

    pub fn with_owner(mut self, owner: Option<String>) -> Self {
        self.owner = owner;
        self
    }

    pub fn layout(&self) -> ChunkLayout {
        ChunkLayout {
            total_size: self.total_size,
            chunk_size: self.chunk_size,
            total_chunks: self.total_chunks,
        }
    }

    pub fn offset_of(&self, index: u64) -> u64 {
        self.layout().offset_of(index)
    }

    pub fn expected_len(&self, index: u64) -> u64 {
        self.layout().expected_len(index)
    }

    /// Bytes covered by the contiguous run of received chunks from the start
    pub fn contiguous_bytes(&self) -> u64 {
        self.offset_of(self.received.contiguous_prefix())
            .min(self.total_size)
    }

    pub fn is_complete(&self) -> bool {
        self.received.is_full()
    }
}

/// A chunk delivered by a client; not persisted beyond processing
#[derive(Debug, Clone)]
pub struct ChunkWriteRequest {
    pub file_id: FileId,
    pub index: u64,
    pub offset: u64,
    pub payload: Bytes,
    /// Hex SHA-256 of the payload, optionally prefixed with `sha256:`
    pub checksum: Option<String>,
}

impl ChunkWriteRequest {
    pub fn new(file_id: FileId, index: u64, offset: u64, payload: Bytes) -> Self {
        Self {
            file_id,
            index,
            offset,
            payload,
            checksum: None,
        }
    }

    pub fn with_checksum<S: Into<String>>(mut self, checksum: S) -> Self {
        self.checksum = Some(checksum.into());
        self
    }
}

/// Request to start a chunked upload
#[derive(Debug, Clone, Default)]
pub struct InitiateUpload {
    pub name: String,
    pub size: u64,
    pub mime: Option<String>,
    pub metadata: FileMetadata,
    /// Falls back to the configured default
    pub chunk_size: Option<u64>,
}

impl InitiateUpload {
    pub fn new<S: Into<String>>(name: S, size: u64) -> Self {
        Self {
            name: name.into(),
            size,
            ..Self::default()
        }
    }

    pub fn with_mime<S: Into<String>>(mut self, mime: S) -> Self {
        self.mime = Some(mime.into());
        self
    }

    pub fn with_metadata(mut self, metadata: FileMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size = Some(chunk_size);
        self
    }
}

/// Returned by initiation: everything the client needs to send chunks
#[derive(Debug, Clone)]
pub struct UploadTicket {
    pub file_id: FileId,
    pub token: SessionToken,
    pub chunk_size: u64,
    pub total_chunks: u64,
}

/// Outcome of a chunk delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkAck {
    pub accepted: bool,
    pub already_received: bool,
    /// True for exactly one delivery per file: the one that finalized it
    pub complete: bool,
    pub received_chunks: u64,
    pub total_chunks: u64,
}

/// Progress report used to resume an upload after reconnecting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadProgress {
    pub file_id: FileId,
    pub status: FileStatus,
    pub chunk_size: u64,
    pub total_chunks: u64,
    pub received_chunks: u64,
    pub received_bytes: u64,
    pub missing: Vec<u64>,
}

impl UploadProgress {
    pub fn from_session(session: &UploadSession, status: FileStatus) -> Self {
        Self {
            file_id: session.file_id.clone(),
            status,
            chunk_size: session.chunk_size,
            total_chunks: session.total_chunks,
            received_chunks: session.received.count(),
            received_bytes: session.received_bytes,
            missing: session.received.missing(),
        }
    }

    /// Progress of a finished upload: every chunk present
    pub fn finished(record: &FileRecord) -> Self {
        let total_chunks = record.size.div_ceil(record.chunk_size.max(1));
        Self {
            file_id: record.id.clone(),
            status: record.status,
            chunk_size: record.chunk_size,
            total_chunks,
            received_chunks: total_chunks,
            received_bytes: record.size,
            missing: Vec::new(),
        }
    }
}

/// Half-open byte range `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

/// What part of a file a reader wants
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RangeSpec {
    Whole,
    Ranges(Vec<ByteRange>),
}

impl RangeSpec {
    pub fn single(start: u64, end: u64) -> Self {
        Self::Ranges(vec![ByteRange::new(start, end)])
    }
}
