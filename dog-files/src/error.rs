use thiserror::Error;

/// Result type for file operations
pub type FilesResult<T> = Result<T, FilesError>;

/// Errors that can occur while uploading, storing or streaming files
#[derive(Error, Debug)]
pub enum FilesError {
    #[error("Invalid size: {message}")]
    InvalidSize { message: String },

    #[error("Invalid metadata: {message}")]
    InvalidMetadata { message: String },

    #[error("Invalid request: {message}")]
    Invalid { message: String },

    #[error("Chunk {index} out of bounds: {message}")]
    ChunkOutOfBounds { index: u64, message: String },

    #[error("Size mismatch: {message}")]
    SizeMismatch { message: String },

    #[error("Upload session already exists: {id}")]
    DuplicateSession { id: String },

    #[error("Blob already allocated: {id}")]
    AlreadyExists { id: String },

    #[error("Chunk {index} of {id} is being written by another request")]
    ChunkInFlight { id: String, index: u64 },

    #[error("Upload {id} is being finalized")]
    Finalizing { id: String },

    #[error("File not found: {id}")]
    NotFound { id: String },

    #[error("Access denied")]
    Forbidden,

    #[error("Invalid session token for upload {id}")]
    InvalidToken { id: String },

    #[error("Chunk {index} of {id} failed checksum verification")]
    ChunkCorrupt { id: String, index: u64 },

    #[error("Upload {id} aborted after {count} corrupt chunks")]
    CorruptionBudgetExceeded { id: String, count: u32 },

    #[error("Storage capacity exceeded: requested {requested} bytes, {available} available")]
    CapacityExceeded { requested: u64, available: u64 },

    #[error("Range {start}..{end} outside blob of {size} bytes")]
    OutOfRange { start: u64, end: u64, size: u64 },

    #[error("Range not satisfiable for {size} bytes")]
    RangeNotSatisfiable { size: u64 },

    #[error("Upload session expired: {id}")]
    SessionExpired { id: String },

    #[error("Upload session aborted: {id}")]
    SessionAborted { id: String },

    #[error("Storage backend error: {source}")]
    Backend {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("Serialization error: {source}")]
    Serialization {
        #[from]
        source: serde_json::Error,
    },
}

/// Closed taxonomy used at the transport boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Bad size/chunk/metadata parameters; the client must fix and retry
    Validation,
    /// Duplicate session or an already resolved race; safe to ignore or retry
    Conflict,
    /// Unknown file or session
    NotFound,
    /// Checksum mismatch; resend the chunk
    Corruption,
    /// Storage exhausted; fatal to the session
    Capacity,
    /// Session expired; restart the upload
    Timeout,
    /// Permission decision was negative or the token is wrong
    Forbidden,
    /// Requested range cannot be served
    RangeNotSatisfiable,
    /// Storage or serialization failure
    Internal,
}

impl ErrorClass {
    pub fn status_code(&self) -> u16 {
        match self {
            ErrorClass::Validation => 400,
            ErrorClass::Forbidden => 403,
            ErrorClass::NotFound => 404,
            ErrorClass::Conflict => 409,
            ErrorClass::Timeout => 410,
            ErrorClass::RangeNotSatisfiable => 416,
            ErrorClass::Corruption => 422,
            ErrorClass::Internal => 500,
            ErrorClass::Capacity => 507,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ErrorClass::Validation => "ValidationError",
            ErrorClass::Conflict => "ConflictError",
            ErrorClass::NotFound => "NotFoundError",
            ErrorClass::Corruption => "CorruptionError",
            ErrorClass::Capacity => "CapacityError",
            ErrorClass::Timeout => "TimeoutError",
            ErrorClass::Forbidden => "Forbidden",
            ErrorClass::RangeNotSatisfiable => "RangeNotSatisfiable",
            ErrorClass::Internal => "IOError",
        }
    }
}

impl FilesError {
    /// Create a backend error from any error type
    pub fn backend<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Backend {
            source: Box::new(error),
        }
    }

    /// Create an invalid request error
    pub fn invalid<S: Into<String>>(message: S) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }

    /// Create an invalid size error
    pub fn invalid_size<S: Into<String>>(message: S) -> Self {
        Self::InvalidSize {
            message: message.into(),
        }
    }

    /// Create an invalid metadata error
    pub fn invalid_metadata<S: Into<String>>(message: S) -> Self {
        Self::InvalidMetadata {
            message: message.into(),
        }
    }

    /// Create a not found error
    pub fn not_found<S: Into<String>>(id: S) -> Self {
        Self::NotFound { id: id.into() }
    }

    pub fn out_of_bounds<S: Into<String>>(index: u64, message: S) -> Self {
        Self::ChunkOutOfBounds {
            index,
            message: message.into(),
        }
    }

    pub fn size_mismatch<S: Into<String>>(message: S) -> Self {
        Self::SizeMismatch {
            message: message.into(),
        }
    }

    /// Map to the transport taxonomy
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::InvalidSize { .. }
            | Self::InvalidMetadata { .. }
            | Self::Invalid { .. }
            | Self::ChunkOutOfBounds { .. }
            | Self::SizeMismatch { .. }
            | Self::OutOfRange { .. } => ErrorClass::Validation,
            Self::DuplicateSession { .. }
            | Self::AlreadyExists { .. }
            | Self::ChunkInFlight { .. }
            | Self::Finalizing { .. }
            | Self::SessionAborted { .. } => ErrorClass::Conflict,
            Self::NotFound { .. } => ErrorClass::NotFound,
            Self::Forbidden | Self::InvalidToken { .. } => ErrorClass::Forbidden,
            Self::ChunkCorrupt { .. } | Self::CorruptionBudgetExceeded { .. } => {
                ErrorClass::Corruption
            }
            Self::CapacityExceeded { .. } => ErrorClass::Capacity,
            Self::SessionExpired { .. } => ErrorClass::Timeout,
            Self::RangeNotSatisfiable { .. } => ErrorClass::RangeNotSatisfiable,
            Self::Backend { .. } | Self::Io { .. } | Self::Serialization { .. } => {
                ErrorClass::Internal
            }
        }
    }

    pub fn status_code(&self) -> u16 {
        self.class().status_code()
    }

    /// Failures worth retrying inside the server before surfacing them
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Backend { .. } => true,
            Self::Io { source } => !matches!(
                source.kind(),
                std::io::ErrorKind::NotFound
                    | std::io::ErrorKind::AlreadyExists
                    | std::io::ErrorKind::PermissionDenied
                    | std::io::ErrorKind::InvalidInput
                    | std::io::ErrorKind::StorageFull
                    | std::io::ErrorKind::QuotaExceeded
            ),
            _ => false,
        }
    }

    /// Turn an out-of-space I/O error into `CapacityExceeded`
    pub fn or_capacity(self, requested: u64) -> Self {
        match &self {
            Self::Io { source }
                if matches!(
                    source.kind(),
                    std::io::ErrorKind::StorageFull | std::io::ErrorKind::QuotaExceeded
                ) =>
            {
                Self::CapacityExceeded {
                    requested,
                    available: 0,
                }
            }
            _ => self,
        }
    }

    /// Errors after which the upload session cannot continue
    pub fn is_fatal_to_session(&self) -> bool {
        matches!(
            self,
            Self::CapacityExceeded { .. } | Self::CorruptionBudgetExceeded { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_maps_to_closed_status_set() {
        assert_eq!(FilesError::invalid_size("zero").status_code(), 400);
        assert_eq!(
            FilesError::DuplicateSession { id: "a".into() }.status_code(),
            409
        );
        assert_eq!(FilesError::not_found("a").status_code(), 404);
        assert_eq!(
            FilesError::ChunkCorrupt { id: "a".into(), index: 3 }.class(),
            ErrorClass::Corruption
        );
        assert_eq!(
            FilesError::CapacityExceeded { requested: 10, available: 1 }.status_code(),
            507
        );
        assert_eq!(FilesError::SessionExpired { id: "a".into() }.status_code(), 410);
        assert_eq!(FilesError::RangeNotSatisfiable { size: 4 }.status_code(), 416);
    }

    #[test]
    fn only_storage_failures_are_transient() {
        let interrupted = FilesError::from(std::io::Error::new(
            std::io::ErrorKind::Interrupted,
            "eintr",
        ));
        assert!(interrupted.is_transient());

        let missing = FilesError::from(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"));
        assert!(!missing.is_transient());

        assert!(!FilesError::CapacityExceeded { requested: 1, available: 0 }.is_transient());
        assert!(FilesError::CapacityExceeded { requested: 1, available: 0 }.is_fatal_to_session());
    }

    #[test]
    fn full_disk_is_a_capacity_error() {
        let full = FilesError::from(std::io::Error::new(std::io::ErrorKind::StorageFull, "no space"));
        assert!(!full.is_transient());
        let mapped = full.or_capacity(4096);
        assert!(matches!(mapped, FilesError::CapacityExceeded { requested: 4096, .. }));
        assert!(mapped.is_fatal_to_session());

        let quota = FilesError::from(std::io::Error::new(std::io::ErrorKind::QuotaExceeded, "quota"));
        assert!(!quota.is_transient());
        assert!(matches!(quota.or_capacity(1), FilesError::CapacityExceeded { .. }));

        let interrupted = FilesError::from(std::io::Error::new(std::io::ErrorKind::Interrupted, "eintr"));
        assert!(matches!(interrupted.or_capacity(1), FilesError::Io { .. }));
    }
}
