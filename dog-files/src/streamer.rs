use bytes::Bytes;
use futures_util::StreamExt;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use std::sync::Arc;
use uuid::Uuid;

use crate::catalog::MetadataCatalog;
use crate::registry::SessionRegistry;
use crate::{
    BlobHandle, ByteRange, ByteStream, ChunkStore, FileId, FileRecord, FileStatus, FilesConfig,
    FilesError, FilesResult, RangeSpec,
};

/// Upper bound on ranges in one `Range` header; longer headers are ignored
const MAX_RANGES: usize = 32;

/// Characters kept as-is in RFC 5987 `filename*` values
const FILENAME_SAFE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'.')
    .remove(b'-')
    .remove(b'_')
    .remove(b'~');

/// Options for a download
#[derive(Debug, Clone, Default)]
pub struct DownloadOptions {
    /// Raw `Range` header value
    pub range: Option<String>,
    /// Serve with `Content-Disposition: attachment`
    pub attachment: bool,
}

impl DownloadOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_range<S: Into<String>>(mut self, range: S) -> Self {
        self.range = Some(range.into());
        self
    }

    pub fn as_attachment(mut self) -> Self {
        self.attachment = true;
        self
    }
}

/// A satisfiable range with an inclusive end, as written in `Content-Range`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedRange {
    pub start: u64,
    pub end: u64,
    /// `None` while the upload is still in progress
    pub total_size: Option<u64>,
}

impl ResolvedRange {
    pub fn from_range(range: &ByteRange, total_size: Option<u64>) -> Self {
        Self {
            start: range.start,
            end: range.end.saturating_sub(1).max(range.start),
            total_size,
        }
    }

    pub fn content_length(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn is_full_content(&self) -> bool {
        self.start == 0 && self.total_size == Some(self.end + 1)
    }

    /// `Content-Range` header value
    pub fn content_range(&self) -> String {
        match self.total_size {
            Some(total) => format!("bytes {}-{}/{}", self.start, self.end, total),
            None => format!("bytes {}-{}/*", self.start, self.end),
        }
    }
}

/// Parse an HTTP `Range` header against a representation of `size` bytes.
///
/// Returns `Ok(None)` when the header should be ignored (not a `bytes` range or
/// syntactically invalid), in which case the whole content is served. Overlapping
/// and adjacent ranges are merged.
pub fn parse_range_header(value: &str, size: u64) -> FilesResult<Option<Vec<ByteRange>>> {
    let Some(specs) = value.trim().strip_prefix("bytes=") else {
        return Ok(None);
    };

    let mut ranges = Vec::new();
    for spec in specs.split(',') {
        let spec = spec.trim();
        if spec.is_empty() {
            continue;
        }
        let Some((first, last)) = spec.split_once('-') else {
            return Ok(None);
        };
        let (first, last) = (first.trim(), last.trim());

        let range = if first.is_empty() {
            let Some(suffix) = digits(last) else {
                return Ok(None);
            };
            if suffix == 0 || size == 0 {
                return Err(FilesError::RangeNotSatisfiable { size });
            }
            ByteRange::new(size.saturating_sub(suffix), size)
        } else {
            let Some(start) = digits(first) else {
                return Ok(None);
            };
            let end = if last.is_empty() {
                size
            } else {
                let Some(last) = digits(last) else {
                    return Ok(None);
                };
                if last < start {
                    return Ok(None);
                }
                last.saturating_add(1).min(size)
            };
            if start >= size {
                return Err(FilesError::RangeNotSatisfiable { size });
            }
            ByteRange::new(start, end)
        };

        ranges.push(range);
        if ranges.len() > MAX_RANGES {
            return Ok(None);
        }
    }

    if ranges.is_empty() {
        return Ok(None);
    }
    Ok(Some(coalesce(ranges)))
}

fn digits(value: &str) -> Option<u64> {
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    value.parse().ok()
}

/// Sort and merge overlapping or touching ranges
pub fn coalesce(mut ranges: Vec<ByteRange>) -> Vec<ByteRange> {
    ranges.sort_by_key(|range| (range.start, range.end));
    let mut merged: Vec<ByteRange> = Vec::with_capacity(ranges.len());
    for range in ranges {
        match merged.last_mut() {
            Some(last) if range.start <= last.end => last.end = last.end.max(range.end),
            _ => merged.push(range),
        }
    }
    merged
}

fn to_io(error: FilesError) -> std::io::Error {
    match error {
        FilesError::Io { source } => source,
        other => std::io::Error::new(std::io::ErrorKind::Other, other),
    }
}

/// Readable view over one file: a fixed list of ranges that can be streamed any number
/// of times, from the start or from an offset.
#[derive(Clone)]
pub struct RangeReader {
    store: Arc<dyn ChunkStore>,
    handle: BlobHandle,
    ranges: Vec<ByteRange>,
    segment_bytes: usize,
    record: FileRecord,
    available: u64,
}

impl RangeReader {
    pub fn record(&self) -> &FileRecord {
        &self.record
    }

    pub fn ranges(&self) -> &[ByteRange] {
        &self.ranges
    }

    /// Bytes currently readable from the start of the file
    pub fn available(&self) -> u64 {
        self.available
    }

    /// Total bytes the stream yields
    pub fn content_length(&self) -> u64 {
        self.ranges.iter().map(ByteRange::len).sum()
    }

    /// Fresh stream over every range
    pub fn stream(&self) -> ByteStream {
        self.stream_from(0)
    }

    /// Stream that skips the first `offset` bytes, for resuming after a pause or disconnect.
    ///
    /// Nothing is opened until the stream is first polled, and the storage handle is
    /// released as soon as the stream is dropped.
    pub fn stream_from(&self, offset: u64) -> ByteStream {
        let store = self.store.clone();
        let handle = self.handle.clone();
        let ranges = self.ranges.clone();
        let segment_bytes = self.segment_bytes;

        Box::pin(async_stream::try_stream! {
            let mut skip = offset;
            for range in ranges {
                let len = range.len();
                if skip >= len {
                    skip -= len;
                    continue;
                }
                let part = ByteRange::new(range.start + skip, range.end);
                skip = 0;

                let mut segments = store
                    .read_range(&handle, part, segment_bytes)
                    .await
                    .map_err(to_io)?;
                while let Some(segment) = segments.next().await {
                    yield segment?;
                }
            }
        })
    }

    /// Lazy stream over one range of the file
    fn stream_range(&self, range: ByteRange) -> ByteStream {
        let mut single = self.clone();
        single.ranges = vec![range];
        single.stream()
    }
}

/// Everything a transport binding needs to answer a download request
pub struct Download {
    pub record: FileRecord,
    /// 200 or 206
    pub status: u16,
    pub content_type: String,
    pub content_length: u64,
    /// Set for single-range responses
    pub content_range: Option<String>,
    pub accept_ranges: &'static str,
    pub content_disposition: String,
    pub cache_control: String,
    pub etag: Option<String>,
    pub body: ByteStream,
}

impl Download {
    pub fn is_partial(&self) -> bool {
        self.status == 206
    }

    /// Response headers as name/value pairs
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            ("Content-Type", self.content_type.clone()),
            ("Content-Length", self.content_length.to_string()),
            ("Accept-Ranges", self.accept_ranges.to_string()),
            ("Content-Disposition", self.content_disposition.clone()),
            ("Cache-Control", self.cache_control.clone()),
        ];
        if let Some(range) = &self.content_range {
            headers.push(("Content-Range", range.clone()));
        }
        if let Some(etag) = &self.etag {
            headers.push(("ETag", etag.clone()));
        }
        headers
    }
}

impl std::fmt::Debug for Download {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Download")
            .field("file_id", &self.record.id)
            .field("status", &self.status)
            .field("content_type", &self.content_type)
            .field("content_length", &self.content_length)
            .field("content_range", &self.content_range)
            .finish_non_exhaustive()
    }
}

/// `Content-Disposition` with an ASCII fallback and an RFC 5987 UTF-8 name
pub fn content_disposition(name: &str, attachment: bool) -> String {
    let kind = if attachment { "attachment" } else { "inline" };
    let fallback: String = name
        .chars()
        .map(|c| {
            if c == ' ' || (c.is_ascii_graphic() && c != '"' && c != '\\') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let encoded = utf8_percent_encode(name, FILENAME_SAFE);
    format!("{}; filename=\"{}\"; filename*=UTF-8''{}", kind, fallback, encoded)
}

/// Read path: serves byte ranges of complete files, and of the contiguous received
/// prefix of active uploads when partial reads are enabled.
pub struct RangeStreamer {
    store: Arc<dyn ChunkStore>,
    catalog: Arc<MetadataCatalog>,
    registry: Arc<SessionRegistry>,
    config: FilesConfig,
}

impl RangeStreamer {
    pub fn new(
        store: Arc<dyn ChunkStore>,
        catalog: Arc<MetadataCatalog>,
        registry: Arc<SessionRegistry>,
        config: FilesConfig,
    ) -> Self {
        Self {
            store,
            catalog,
            registry,
            config,
        }
    }

    /// The record and how many bytes of it may be read
    async fn readable(&self, file_id: &FileId) -> FilesResult<(FileRecord, u64)> {
        let (record, available) = self.readable_record(file_id).await?;
        // A record can outlive its blob if storage lost it.
        self.store.open(file_id).await?;
        Ok((record, available))
    }

    async fn readable_record(&self, file_id: &FileId) -> FilesResult<(FileRecord, u64)> {
        let record = self.catalog.get(file_id).await?;
        match record.status {
            FileStatus::Complete => {
                let size = record.size;
                Ok((record, size))
            }
            status if status.is_active() && self.config.allow_partial_reads => {
                if let Some(available) = self.registry.contiguous_bytes(file_id).await {
                    return Ok((record, available));
                }
                // The session may have just finalized.
                let record = self.catalog.get(file_id).await?;
                if record.status == FileStatus::Complete {
                    let size = record.size;
                    return Ok((record, size));
                }
                Err(FilesError::not_found(file_id.as_str()))
            }
            _ => Err(FilesError::not_found(file_id.as_str())),
        }
    }

    /// Open `spec` for reading.
    ///
    /// Fails with `NotFound` unless the file is complete (or partial reads are enabled
    /// and it is still uploading), and with `RangeNotSatisfiable` when any range starts
    /// at or past the readable length. Range ends are clamped to that length.
    pub async fn open_read(&self, file_id: &FileId, spec: RangeSpec) -> FilesResult<RangeReader> {
        let (record, available) = self.readable(file_id).await?;

        let ranges = match spec {
            RangeSpec::Whole if available == 0 => Vec::new(),
            RangeSpec::Whole => vec![ByteRange::new(0, available)],
            RangeSpec::Ranges(ranges) => {
                if ranges.is_empty() {
                    return Err(FilesError::invalid("no ranges requested"));
                }
                let mut clamped = Vec::with_capacity(ranges.len());
                for range in ranges {
                    if range.start > range.end {
                        return Err(FilesError::invalid(format!(
                            "range {}..{} ends before it starts",
                            range.start, range.end
                        )));
                    }
                    if range.start >= available {
                        return Err(FilesError::RangeNotSatisfiable { size: available });
                    }
                    clamped.push(ByteRange::new(range.start, range.end.min(available)));
                }
                clamped
            }
        };

        Ok(RangeReader {
            store: self.store.clone(),
            handle: BlobHandle::new(file_id.clone(), record.size),
            ranges,
            segment_bytes: self.config.read_segment_bytes,
            record,
            available,
        })
    }

    /// Resolve a download request the way an HTTP server would answer it
    pub async fn open_download(&self, file_id: &FileId, options: DownloadOptions) -> FilesResult<Download> {
        let (_, available) = self.readable(file_id).await?;
        let requested = match options.range.as_deref() {
            Some(header) => parse_range_header(header, available)?,
            None => None,
        };

        let reader = match requested.clone() {
            Some(ranges) => self.open_read(file_id, RangeSpec::Ranges(ranges)).await?,
            None => self.open_read(file_id, RangeSpec::Whole).await?,
        };
        let record = reader.record().clone();
        let complete = record.status == FileStatus::Complete;
        let total = complete.then_some(record.size);

        let content_disposition = content_disposition(&record.name, options.attachment);
        let etag = record
            .checksum
            .as_ref()
            .filter(|_| complete)
            .map(|checksum| format!("\"{}\"", checksum));

        let (status, content_type, content_length, content_range, body) = match requested {
            None => (
                200,
                record.mime.clone(),
                reader.content_length(),
                None,
                reader.stream(),
            ),
            Some(ranges) if ranges.len() == 1 => {
                let resolved = ResolvedRange::from_range(&reader.ranges()[0], total);
                (
                    206,
                    record.mime.clone(),
                    reader.content_length(),
                    Some(resolved.content_range()),
                    reader.stream(),
                )
            }
            Some(_) => {
                let (content_type, content_length, body) = multipart(&reader, total);
                (206, content_type, content_length, None, body)
            }
        };

        Ok(Download {
            record,
            status,
            content_type,
            content_length,
            content_range,
            accept_ranges: "bytes",
            content_disposition,
            cache_control: self.config.cache_control.clone(),
            etag,
            body,
        })
    }
}

/// `multipart/byteranges` body over the reader's ranges, with its exact length
fn multipart(reader: &RangeReader, total: Option<u64>) -> (String, u64, ByteStream) {
    let boundary = Uuid::new_v4().simple().to_string();
    let mime = reader.record().mime.clone();

    let parts: Vec<(Bytes, ByteRange)> = reader
        .ranges()
        .iter()
        .map(|range| {
            let resolved = ResolvedRange::from_range(range, total);
            let head = format!(
                "--{}\r\nContent-Type: {}\r\nContent-Range: {}\r\n\r\n",
                boundary,
                mime,
                resolved.content_range()
            );
            (Bytes::from(head), *range)
        })
        .collect();
    let closing = Bytes::from(format!("--{}--\r\n", boundary));

    let content_length = parts
        .iter()
        .map(|(head, range)| head.len() as u64 + range.len() + 2)
        .sum::<u64>()
        + closing.len() as u64;

    let reader = reader.clone();
    let body: ByteStream = Box::pin(async_stream::try_stream! {
        for (head, range) in parts {
            yield head;
            let mut segments = reader.stream_range(range);
            while let Some(segment) = segments.next().await {
                yield segment?;
            }
            yield Bytes::from_static(b"\r\n");
        }
        yield closing;
    });

    (
        format!("multipart/byteranges; boundary={}", boundary),
        content_length,
        body,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_suffix_and_open_ranges() {
        assert_eq!(
            parse_range_header("bytes=1048576-2097151", 10_485_760).unwrap(),
            Some(vec![ByteRange::new(1_048_576, 2_097_152)])
        );
        assert_eq!(
            parse_range_header("bytes=-4", 10).unwrap(),
            Some(vec![ByteRange::new(6, 10)])
        );
        assert_eq!(
            parse_range_header("bytes=7-", 10).unwrap(),
            Some(vec![ByteRange::new(7, 10)])
        );
        assert_eq!(
            parse_range_header("bytes=5-100", 10).unwrap(),
            Some(vec![ByteRange::new(5, 10)])
        );
    }

    #[test]
    fn malformed_headers_are_ignored() {
        for header in ["items=0-1", "bytes=0-1-2", "bytes=abc", "bytes=5-2", "bytes=+1-2", "bytes="] {
            assert_eq!(parse_range_header(header, 10).unwrap(), None, "{}", header);
        }
    }

    #[test]
    fn unsatisfiable_ranges_are_rejected() {
        assert!(matches!(
            parse_range_header("bytes=10-", 10),
            Err(FilesError::RangeNotSatisfiable { size: 10 })
        ));
        assert!(matches!(
            parse_range_header("bytes=-0", 10),
            Err(FilesError::RangeNotSatisfiable { .. })
        ));
        assert!(matches!(
            parse_range_header("bytes=0-1", 0),
            Err(FilesError::RangeNotSatisfiable { size: 0 })
        ));
    }

    #[test]
    fn overlapping_ranges_are_merged() {
        assert_eq!(
            parse_range_header("bytes=0-1, 2-3, 8-9, 1-2", 10).unwrap(),
            Some(vec![ByteRange::new(0, 4), ByteRange::new(8, 10)])
        );
    }

    #[test]
    fn resolved_ranges_format_content_range() {
        let resolved = ResolvedRange::from_range(&ByteRange::new(0, 10), Some(10));
        assert_eq!(resolved.content_range(), "bytes 0-9/10");
        assert!(resolved.is_full_content());
        assert_eq!(resolved.content_length(), 10);

        let partial = ResolvedRange::from_range(&ByteRange::new(2, 4), None);
        assert_eq!(partial.content_range(), "bytes 2-3/*");
    }

    #[test]
    fn disposition_escapes_non_ascii_names() {
        assert_eq!(
            content_disposition("clip.mp4", false),
            "inline; filename=\"clip.mp4\"; filename*=UTF-8''clip.mp4"
        );
        assert_eq!(
            content_disposition("café \"x\".txt", true),
            "attachment; filename=\"caf_ _x_.txt\"; filename*=UTF-8''caf%C3%A9%20%22x%22.txt"
        );
    }
}
