use bytes::Bytes;
use chrono::Utc;
use dog_files::prelude::*;
use dog_files::{BlobHandle, FileEvent, JsonDirRecordStore, RecordStore, UploadSession};
use futures::StreamExt;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;

fn request(file_id: &FileId, data: &[u8], chunk_size: usize, index: usize) -> ChunkWriteRequest {
    let start = index * chunk_size;
    let end = (start + chunk_size).min(data.len());
    ChunkWriteRequest::new(
        file_id.clone(),
        index as u64,
        start as u64,
        Bytes::copy_from_slice(&data[start..end]),
    )
}

async fn read_all(adapter: &FilesAdapter, ctx: &FilesCtx, file_id: &FileId) -> Vec<u8> {
    let reader = adapter.open_read(ctx.clone(), file_id, RangeSpec::Whole).await.unwrap();
    let mut stream = reader.stream();
    let mut out = Vec::new();
    while let Some(segment) = stream.next().await {
        out.extend_from_slice(&segment.unwrap());
    }
    out
}

async fn durable_adapter(root: &Path, config: FilesConfig) -> FilesAdapter {
    let store = FsChunkStore::open(root.join("blobs")).await.unwrap();
    let records = JsonDirRecordStore::<FileRecord>::open(root.join("records")).await.unwrap();
    let sessions = JsonDirRecordStore::<UploadSession>::open(root.join("sessions")).await.unwrap();
    FilesAdapter::builder(store)
        .config(config)
        .records(records)
        .sessions(sessions)
        .build()
        .unwrap()
}

#[tokio::test]
async fn stale_sessions_expire_on_demand() {
    let store = MemoryChunkStore::new();
    let adapter = FilesAdapter::new(store.clone(), FilesConfig::default()).unwrap();
    let ctx = FilesCtx::new("alice");
    let ticket = adapter
        .initiate_upload(ctx.clone(), InitiateUpload::new("a.bin", 8).with_chunk_size(4))
        .await
        .unwrap();

    assert!(adapter.expire_stale(Utc::now()).await.unwrap().is_empty());

    let later = Utc::now() + chrono::Duration::hours(4);
    assert_eq!(adapter.expire_stale(later).await.unwrap(), vec![ticket.file_id.clone()]);
    assert!(!store.contains(&ticket.file_id));

    let record = adapter.get_file_info(ctx.clone(), &ticket.file_id).await.unwrap();
    assert_eq!(record.status, FileStatus::Expired);
    assert!(matches!(
        adapter.upload_chunk(ctx.clone(), request(&ticket.file_id, b"abcdefgh", 4, 0)).await,
        Err(FilesError::SessionExpired { .. })
    ));
    assert!(matches!(
        adapter.resume_upload(ctx, &ticket.file_id, ticket.token.as_str()).await,
        Err(FilesError::SessionExpired { .. })
    ));
}

#[tokio::test]
async fn sweeper_reclaims_abandoned_uploads() {
    let config = FilesConfig::default()
        .with_session_timeout(Duration::from_millis(50))
        .with_sweep_interval(Duration::from_millis(20));
    let store = MemoryChunkStore::new();
    let adapter = FilesAdapter::new(store.clone(), config).unwrap();
    let ctx = FilesCtx::new("alice");
    let ticket = adapter
        .initiate_upload(ctx.clone(), InitiateUpload::new("a.bin", 8).with_chunk_size(4))
        .await
        .unwrap();
    adapter
        .upload_chunk(ctx.clone(), request(&ticket.file_id, b"abcdefgh", 4, 0))
        .await
        .unwrap();

    let sweeper = adapter.spawn_sweeper();
    let mut status = FileStatus::InProgress;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        status = adapter.get_file_info(ctx.clone(), &ticket.file_id).await.unwrap().status;
        if status == FileStatus::Expired {
            break;
        }
    }
    sweeper.abort();

    assert_eq!(status, FileStatus::Expired);
    assert!(!store.contains(&ticket.file_id));
}

#[tokio::test]
async fn filesystem_upload_is_sniffed_and_hashed() {
    let dir = TempDir::new().unwrap();
    let adapter = durable_adapter(dir.path(), FilesConfig::default()).await;
    let ctx = FilesCtx::new("alice");

    let mut data = vec![0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
    data.extend((0..5000u32).map(|i| (i % 256) as u8));
    let ticket = adapter
        .initiate_upload(
            ctx.clone(),
            InitiateUpload::new("photo.bin", data.len() as u64)
                .with_mime("application/octet-stream")
                .with_chunk_size(1000),
        )
        .await
        .unwrap();

    for index in (0..ticket.total_chunks as usize).rev() {
        adapter
            .upload_chunk(ctx.clone(), request(&ticket.file_id, &data, 1000, index))
            .await
            .unwrap();
    }

    let record = adapter.get_file_info(ctx.clone(), &ticket.file_id).await.unwrap();
    assert_eq!(record.status, FileStatus::Complete);
    assert_eq!(record.mime, "image/png");
    assert!(record.is_image);
    assert_eq!(record.checksum.as_deref(), Some(hex::encode(Sha256::digest(&data)).as_str()));
    assert!(dir.path().join("blobs/sealed").join(ticket.file_id.as_str()).exists());

    assert_eq!(read_all(&adapter, &ctx, &ticket.file_id).await, data);

    let download = adapter
        .open_download(ctx, &ticket.file_id, DownloadOptions::new().as_attachment())
        .await
        .unwrap();
    assert_eq!(download.etag, Some(format!("\"{}\"", hex::encode(Sha256::digest(&data)))));
    assert!(download.content_disposition.starts_with("attachment;"));
}

#[tokio::test]
async fn uploads_resume_after_restart() {
    let dir = TempDir::new().unwrap();
    let ctx = FilesCtx::new("alice");
    let data: Vec<u8> = (0..30u8).collect();

    let ticket = {
        let adapter = durable_adapter(dir.path(), FilesConfig::default()).await;
        let ticket = adapter
            .initiate_upload(ctx.clone(), InitiateUpload::new("log.txt", 30).with_chunk_size(10))
            .await
            .unwrap();
        for index in [0, 1] {
            adapter
                .upload_chunk(ctx.clone(), request(&ticket.file_id, &data, 10, index))
                .await
                .unwrap();
        }
        ticket
    };

    let adapter = durable_adapter(dir.path(), FilesConfig::default()).await;
    assert_eq!(adapter.restore().await.unwrap(), 1);

    let progress = adapter
        .resume_upload(ctx.clone(), &ticket.file_id, ticket.token.as_str())
        .await
        .unwrap();
    assert_eq!(progress.status, FileStatus::InProgress);
    assert_eq!(progress.missing, vec![2]);
    assert_eq!(progress.received_bytes, 20);

    let ack = adapter
        .upload_chunk(ctx.clone(), request(&ticket.file_id, &data, 10, 2))
        .await
        .unwrap();
    assert!(ack.complete);
    assert_eq!(read_all(&adapter, &ctx, &ticket.file_id).await, data);

    let files = adapter.list_files(ctx).await.unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].status, FileStatus::Complete);
}

async fn session_store(root: &Path) -> JsonDirRecordStore<UploadSession> {
    JsonDirRecordStore::open(root.join("sessions")).await.unwrap()
}

#[tokio::test]
async fn restore_finishes_uploads_interrupted_before_finalize() {
    let dir = TempDir::new().unwrap();
    let ctx = FilesCtx::new("alice");
    let data = b"abcdefgh";

    let ticket = {
        let adapter = durable_adapter(dir.path(), FilesConfig::default()).await;
        let ticket = adapter
            .initiate_upload(ctx.clone(), InitiateUpload::new("crash.txt", 8).with_chunk_size(4))
            .await
            .unwrap();
        adapter
            .upload_chunk(ctx.clone(), request(&ticket.file_id, data, 4, 0))
            .await
            .unwrap();
        ticket
    };

    // The last chunk reached the blob and the snapshot, then the process stopped.
    let store = FsChunkStore::open(dir.path().join("blobs")).await.unwrap();
    store
        .write_chunk(&BlobHandle::new(ticket.file_id.clone(), 8), 4, Bytes::from_static(b"efgh"))
        .await
        .unwrap();
    let sessions = session_store(dir.path()).await;
    let mut snapshot = sessions.get(&ticket.file_id).await.unwrap().unwrap();
    assert!(snapshot.received.test_and_set(1));
    snapshot.received_bytes = 8;
    sessions.upsert(&ticket.file_id, &snapshot).await.unwrap();

    let adapter = durable_adapter(dir.path(), FilesConfig::default()).await;
    let mut events = adapter.subscribe();
    assert_eq!(adapter.restore().await.unwrap(), 1);

    let record = adapter.get_file_info(ctx.clone(), &ticket.file_id).await.unwrap();
    assert_eq!(record.status, FileStatus::Complete);
    assert_eq!(record.checksum.as_deref(), Some(hex::encode(Sha256::digest(data)).as_str()));
    assert!(matches!(
        events.next().await,
        Some(Ok(FileEvent::Completed { size: 8, .. }))
    ));
    assert!(adapter.is_upload_complete(ctx.clone(), &ticket.file_id).await.unwrap());
    assert!(sessions.get(&ticket.file_id).await.unwrap().is_none());

    let later = Utc::now() + chrono::Duration::hours(4);
    assert!(adapter.expire_stale(later).await.unwrap().is_empty());
    assert!(dir.path().join("blobs/sealed").join(ticket.file_id.as_str()).exists());
    assert_eq!(read_all(&adapter, &ctx, &ticket.file_id).await, data);

    let retry = adapter
        .upload_chunk(ctx, request(&ticket.file_id, data, 4, 1))
        .await
        .unwrap();
    assert!(retry.already_received);
    assert!(!retry.complete);
}

#[tokio::test]
async fn restore_drops_leftover_sessions_of_completed_uploads() {
    let dir = TempDir::new().unwrap();
    let ctx = FilesCtx::new("alice");
    let data = b"abcdefgh";

    let (ticket, mut leftover) = {
        let adapter = durable_adapter(dir.path(), FilesConfig::default()).await;
        let ticket = adapter
            .initiate_upload(ctx.clone(), InitiateUpload::new("done.txt", 8).with_chunk_size(4))
            .await
            .unwrap();
        adapter
            .upload_chunk(ctx.clone(), request(&ticket.file_id, data, 4, 0))
            .await
            .unwrap();
        let snapshot = session_store(dir.path())
            .await
            .get(&ticket.file_id)
            .await
            .unwrap()
            .unwrap();
        let ack = adapter
            .upload_chunk(ctx.clone(), request(&ticket.file_id, data, 4, 1))
            .await
            .unwrap();
        assert!(ack.complete);
        (ticket, snapshot)
    };

    // The record was marked Complete but the process stopped before the snapshot was removed.
    let sessions = session_store(dir.path()).await;
    assert!(leftover.received.test_and_set(1));
    leftover.received_bytes = 8;
    sessions.upsert(&ticket.file_id, &leftover).await.unwrap();

    let adapter = durable_adapter(dir.path(), FilesConfig::default()).await;
    assert_eq!(adapter.restore().await.unwrap(), 1);
    assert!(sessions.get(&ticket.file_id).await.unwrap().is_none());

    let later = Utc::now() + chrono::Duration::hours(4);
    assert!(adapter.expire_stale(later).await.unwrap().is_empty());
    assert_eq!(
        adapter.get_file_info(ctx.clone(), &ticket.file_id).await.unwrap().status,
        FileStatus::Complete
    );

    let download = adapter
        .open_download(ctx, &ticket.file_id, DownloadOptions::new())
        .await
        .unwrap();
    assert_eq!(download.status, 200);
    let mut body = Vec::new();
    let mut stream = download.body;
    while let Some(segment) = stream.next().await {
        body.extend_from_slice(&segment.unwrap());
    }
    assert_eq!(body, data);
}
