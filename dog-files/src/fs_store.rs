use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tracing::{debug, info, warn};

use crate::keyed_mutex::KeyedMutex;
use crate::{BlobHandle, ByteRange, ByteStream, ChunkStore, FileId, FilesError, FilesResult};

const PARTIAL_DIR: &str = "partial";
const SEALED_DIR: &str = "sealed";

/// Local filesystem chunk store.
///
/// Blobs receiving chunks live in `<root>/partial/<id>`; `finalize` renames them into
/// `<root>/sealed/<id>`. The rename is atomic, so a blob is visible as sealed only once
/// every byte has been written.
#[derive(Clone)]
pub struct FsChunkStore {
    root: PathBuf,
    capacity: Option<u64>,
    used: Arc<AtomicU64>,
    write_locks: Arc<KeyedMutex<(FileId, u64)>>,
}

impl FsChunkStore {
    /// Open a store rooted at `root`, creating its directories when missing
    pub async fn open<P: AsRef<Path>>(root: P) -> FilesResult<Self> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(root.join(PARTIAL_DIR)).await?;
        tokio::fs::create_dir_all(root.join(SEALED_DIR)).await?;

        let used = dir_usage(&root.join(PARTIAL_DIR)).await? + dir_usage(&root.join(SEALED_DIR)).await?;
        info!("Opened filesystem chunk store at {} ({} bytes in use)", root.display(), used);

        Ok(Self {
            root,
            capacity: None,
            used: Arc::new(AtomicU64::new(used)),
            write_locks: Arc::new(KeyedMutex::new()),
        })
    }

    /// Limit the total bytes this store may allocate
    pub fn with_capacity(mut self, bytes: u64) -> Self {
        self.capacity = Some(bytes);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Bytes currently reserved by partial and sealed blobs
    pub fn used_bytes(&self) -> u64 {
        self.used.load(Ordering::Acquire)
    }

    fn partial_path(&self, id: &FileId) -> FilesResult<PathBuf> {
        Ok(self.root.join(PARTIAL_DIR).join(checked(id)?))
    }

    fn sealed_path(&self, id: &FileId) -> FilesResult<PathBuf> {
        Ok(self.root.join(SEALED_DIR).join(checked(id)?))
    }

    fn reserve(&self, bytes: u64) -> FilesResult<()> {
        let Some(capacity) = self.capacity else {
            self.used.fetch_add(bytes, Ordering::AcqRel);
            return Ok(());
        };
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(bytes).filter(|total| *total <= capacity)
            })
            .map(|_| ())
            .map_err(|used| FilesError::CapacityExceeded {
                requested: bytes,
                available: capacity.saturating_sub(used),
            })
    }

    fn release(&self, bytes: u64) {
        let _ = self
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                Some(used.saturating_sub(bytes))
            });
    }

    /// Open the blob, preferring the sealed copy. A finalize racing with this call
    /// moves the file from partial to sealed, so sealed is checked again last.
    async fn open_existing(&self, id: &FileId) -> FilesResult<(File, bool)> {
        let sealed = self.sealed_path(id)?;
        let partial = self.partial_path(id)?;
        for (path, is_sealed) in [(&sealed, true), (&partial, false), (&sealed, true)] {
            match File::open(path).await {
                Ok(file) => return Ok((file, is_sealed)),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(FilesError::not_found(id.as_str()))
    }
}

fn checked(id: &FileId) -> FilesResult<&str> {
    if id.is_path_safe() {
        Ok(id.as_str())
    } else {
        Err(FilesError::invalid(format!("unsafe file id {:?}", id.as_str())))
    }
}

async fn dir_usage(dir: &Path) -> FilesResult<u64> {
    let mut total = 0;
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let meta = entry.metadata().await?;
        if meta.is_file() {
            total += meta.len();
        }
    }
    Ok(total)
}

#[cfg(unix)]
async fn sync_dir(dir: &Path) -> FilesResult<()> {
    File::open(dir).await?.sync_all().await?;
    Ok(())
}

#[cfg(not(unix))]
async fn sync_dir(_dir: &Path) -> FilesResult<()> {
    Ok(())
}

#[async_trait]
impl ChunkStore for FsChunkStore {
    async fn allocate(&self, id: &FileId, total_size: u64) -> FilesResult<BlobHandle> {
        let partial = self.partial_path(id)?;
        if tokio::fs::try_exists(self.sealed_path(id)?).await? {
            return Err(FilesError::AlreadyExists { id: id.to_string() });
        }

        self.reserve(total_size)?;

        let created = async {
            let file = OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&partial)
                .await?;
            file.set_len(total_size).await?;
            file.sync_all().await?;
            sync_dir(&self.root.join(PARTIAL_DIR)).await
        };

        match created.await {
            Ok(()) => {
                debug!(file_id = %id, total_size, "allocated blob");
                Ok(BlobHandle::new(id.clone(), total_size))
            }
            Err(FilesError::Io { source }) if source.kind() == std::io::ErrorKind::AlreadyExists => {
                self.release(total_size);
                Err(FilesError::AlreadyExists { id: id.to_string() })
            }
            Err(e) => {
                self.release(total_size);
                if let Err(cleanup) = tokio::fs::remove_file(&partial).await {
                    if cleanup.kind() != std::io::ErrorKind::NotFound {
                        warn!(file_id = %id, "failed to remove partial blob: {}", cleanup);
                    }
                }
                Err(e.or_capacity(total_size))
            }
        }
    }

    async fn write_chunk(&self, handle: &BlobHandle, offset: u64, bytes: Bytes) -> FilesResult<()> {
        let end = offset
            .checked_add(bytes.len() as u64)
            .ok_or_else(|| FilesError::invalid("chunk offset overflows"))?;
        if end > handle.size {
            return Err(FilesError::OutOfRange {
                start: offset,
                end,
                size: handle.size,
            });
        }

        let _guard = self.write_locks.lock((handle.id.clone(), offset)).await;

        let partial = self.partial_path(&handle.id)?;
        let mut file = match OpenOptions::new().write(true).open(&partial).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if tokio::fs::try_exists(self.sealed_path(&handle.id)?).await? {
                    return Err(FilesError::invalid(format!("blob {} is sealed", handle.id)));
                }
                return Err(FilesError::not_found(handle.id.as_str()));
            }
            Err(e) => return Err(e.into()),
        };

        let written: std::io::Result<()> = async {
            file.seek(SeekFrom::Start(offset)).await?;
            file.write_all(&bytes).await?;
            file.sync_data().await
        }
        .await;
        written.map_err(|e| FilesError::from(e).or_capacity(bytes.len() as u64))
    }

    async fn read_range(
        &self,
        handle: &BlobHandle,
        range: ByteRange,
        segment_bytes: usize,
    ) -> FilesResult<ByteStream> {
        let (mut file, _sealed) = self.open_existing(&handle.id).await?;
        let size = file.metadata().await?.len();

        if range.start > range.end || range.end > size {
            return Err(FilesError::OutOfRange {
                start: range.start,
                end: range.end,
                size,
            });
        }

        file.seek(SeekFrom::Start(range.start)).await?;
        let segment = segment_bytes.max(1);
        let mut remaining = range.len();

        // The file handle moves into the generator and closes when the stream is dropped.
        let stream = async_stream::try_stream! {
            while remaining > 0 {
                let want = remaining.min(segment as u64) as usize;
                let mut buf = BytesMut::zeroed(want);
                let mut filled = 0;
                while filled < want {
                    let n = file.read(&mut buf[filled..]).await?;
                    if n == 0 {
                        Err::<(), _>(std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            "blob shorter than its allocated size",
                        ))?;
                    }
                    filled += n;
                }
                remaining -= want as u64;
                yield buf.freeze();
            }
        };

        Ok(Box::pin(stream))
    }

    async fn finalize(&self, handle: &BlobHandle) -> FilesResult<BlobHandle> {
        let partial = self.partial_path(&handle.id)?;
        let sealed = self.sealed_path(&handle.id)?;

        match File::open(&partial).await {
            Ok(file) => {
                file.sync_all().await?;
                drop(file);
                tokio::fs::rename(&partial, &sealed).await?;
                sync_dir(&self.root.join(SEALED_DIR)).await?;
                sync_dir(&self.root.join(PARTIAL_DIR)).await?;
                debug!(file_id = %handle.id, "sealed blob");
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if !tokio::fs::try_exists(&sealed).await? {
                    return Err(FilesError::not_found(handle.id.as_str()));
                }
            }
            Err(e) => return Err(e.into()),
        }

        Ok(handle.clone().sealed())
    }

    async fn delete(&self, handle: &BlobHandle) -> FilesResult<()> {
        for path in [self.partial_path(&handle.id)?, self.sealed_path(&handle.id)?] {
            let len = match tokio::fs::metadata(&path).await {
                Ok(meta) => meta.len(),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            match tokio::fs::remove_file(&path).await {
                Ok(()) => self.release(len),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn open(&self, id: &FileId) -> FilesResult<BlobHandle> {
        let (file, sealed) = self.open_existing(id).await?;
        let size = file.metadata().await?.len();
        let handle = BlobHandle::new(id.clone(), size);
        Ok(if sealed { handle.sealed() } else { handle })
    }
}
