//! Finalize-time MIME detection from the leading bytes of a blob.
//!
//! [`sniff`] checks, in order: ISO base media `ftyp` brands (their box size can look
//! like an ICO header), the fixed prefix signatures, then the container formats that
//! need a second look (RIFF subtypes, EBML doctypes, MPEG audio frame sync). Nothing is
//! inferred from the name.

/// Bytes read from the start of a blob for sniffing
pub const SNIFF_LEN: usize = 4096;

pub const OCTET_STREAM: &str = "application/octet-stream";

/// Prefix signatures checked before the container formats
const SIGNATURES: &[(&[u8], &str)] = &[
    // Images
    (&[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A], "image/png"),
    (&[0xFF, 0xD8, 0xFF], "image/jpeg"),
    (b"GIF87a", "image/gif"),
    (b"GIF89a", "image/gif"),
    (b"BM", "image/bmp"),
    (&[0x49, 0x49, 0x2A, 0x00], "image/tiff"),
    (&[0x4D, 0x4D, 0x00, 0x2A], "image/tiff"),
    (&[0x00, 0x00, 0x01, 0x00], "image/x-icon"),
    // Documents and archives
    (b"%PDF-", "application/pdf"),
    (&[0x50, 0x4B, 0x03, 0x04], "application/zip"),
    (&[0x50, 0x4B, 0x05, 0x06], "application/zip"),
    (&[0x1F, 0x8B], "application/gzip"),
    (&[0x37, 0x7A, 0xBC, 0xAF, 0x27, 0x1C], "application/x-7z-compressed"),
    (b"Rar!\x1A\x07", "application/vnd.rar"),
    (&[0x00, 0x61, 0x73, 0x6D], "application/wasm"),
    // Audio
    (b"OggS", "audio/ogg"),
    (b"fLaC", "audio/flac"),
    (b"ID3", "audio/mpeg"),
    (b"MThd", "audio/midi"),
];

/// Detect the MIME type of `head`, the first bytes of a blob
pub fn sniff(head: &[u8]) -> Option<&'static str> {
    if let Some(mime) = iso_media(head) {
        return Some(mime);
    }
    if let Some((_, mime)) = SIGNATURES.iter().find(|(magic, _)| head.starts_with(magic)) {
        return Some(*mime);
    }
    riff(head)
        .or_else(|| ebml(head))
        .or_else(|| mpeg_audio(head))
}

fn riff(head: &[u8]) -> Option<&'static str> {
    if head.len() < 12 || &head[..4] != b"RIFF" {
        return None;
    }
    match &head[8..12] {
        b"WEBP" => Some("image/webp"),
        b"WAVE" => Some("audio/wav"),
        b"AVI " => Some("video/x-msvideo"),
        _ => None,
    }
}

/// ISO base media (`ftyp` box at offset 4), keyed on the major brand
fn iso_media(head: &[u8]) -> Option<&'static str> {
    if head.len() < 12 || &head[4..8] != b"ftyp" {
        return None;
    }
    let brand = &head[8..12];
    Some(match brand {
        b"M4A " | b"M4B " => "audio/mp4",
        b"qt  " => "video/quicktime",
        b"avif" => "image/avif",
        b"heic" | b"heix" => "image/heic",
        _ if brand.starts_with(b"3g") => "video/3gpp",
        _ => "video/mp4",
    })
}

/// Matroska and WebM share the EBML header; the doctype tells them apart
fn ebml(head: &[u8]) -> Option<&'static str> {
    if !head.starts_with(&[0x1A, 0x45, 0xDF, 0xA3]) {
        return None;
    }
    let window = &head[..head.len().min(64)];
    if window.windows(4).any(|w| w == b"webm") {
        Some("video/webm")
    } else {
        Some("video/x-matroska")
    }
}

/// Bare MPEG audio frame: 11 sync bits, a valid version and layer III
fn mpeg_audio(head: &[u8]) -> Option<&'static str> {
    match head {
        [0xFF, second, ..] if second & 0xE0 == 0xE0 && second & 0x18 != 0x08 && second & 0x06 == 0x02 => {
            Some("audio/mpeg")
        }
        _ => None,
    }
}

/// MIME type commonly associated with a lower-case extension
pub fn mime_for_extension(extension: &str) -> Option<&'static str> {
    let mime = match extension {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "bmp" => "image/bmp",
        "tif" | "tiff" => "image/tiff",
        "ico" => "image/x-icon",
        "svg" => "image/svg+xml",
        "avif" => "image/avif",
        "mp4" | "m4v" => "video/mp4",
        "mov" => "video/quicktime",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        "avi" => "video/x-msvideo",
        "3gp" => "video/3gpp",
        "ts" => "video/mp2t",
        "mp3" => "audio/mpeg",
        "m4a" => "audio/mp4",
        "wav" => "audio/wav",
        "ogg" | "oga" => "audio/ogg",
        "flac" => "audio/flac",
        "mid" | "midi" => "audio/midi",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "gz" => "application/gzip",
        "7z" => "application/x-7z-compressed",
        "rar" => "application/vnd.rar",
        "wasm" => "application/wasm",
        "json" => "application/json",
        "txt" | "log" => "text/plain",
        "csv" => "text/csv",
        "md" => "text/markdown",
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "xml" => "application/xml",
        _ => return None,
    };
    Some(mime)
}

/// Final MIME type: sniffed, then declared, then by extension, then octet-stream
pub fn resolve_mime(sniffed: Option<&str>, declared: Option<&str>, extension: &str) -> String {
    sniffed
        .or_else(|| declared.map(str::trim).filter(|mime| !mime.is_empty()))
        .or_else(|| mime_for_extension(extension))
        .unwrap_or(OCTET_STREAM)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_prefix_signatures() {
        assert_eq!(sniff(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0]), Some("image/png"));
        assert_eq!(sniff(&[0xFF, 0xD8, 0xFF, 0xE0]), Some("image/jpeg"));
        assert_eq!(sniff(b"%PDF-1.7\n"), Some("application/pdf"));
        assert_eq!(sniff(b"ID3\x04\x00"), Some("audio/mpeg"));
        assert_eq!(sniff(b"plain text"), None);
        assert_eq!(sniff(&[]), None);
    }

    #[test]
    fn detects_container_formats() {
        assert_eq!(sniff(b"RIFF\x00\x00\x00\x00WEBPVP8 "), Some("image/webp"));
        assert_eq!(sniff(b"RIFF\x00\x00\x00\x00WAVEfmt "), Some("audio/wav"));
        assert_eq!(sniff(b"\x00\x00\x00\x20ftypisom\x00\x00"), Some("video/mp4"));
        assert_eq!(sniff(b"\x00\x00\x00\x20ftypM4A \x00\x00"), Some("audio/mp4"));
        assert_eq!(sniff(b"\x00\x00\x00\x14ftypqt  \x00\x00"), Some("video/quicktime"));
        assert_eq!(sniff(b"\x1A\x45\xDF\xA3\x9F\x42\x82\x84webm"), Some("video/webm"));
        assert_eq!(sniff(b"\x1A\x45\xDF\xA3\x9F\x42\x82\x88matroska"), Some("video/x-matroska"));
        assert_eq!(sniff(&[0xFF, 0xFB, 0x90, 0x00]), Some("audio/mpeg"));
    }

    #[test]
    fn resolution_prefers_sniffed_then_declared() {
        assert_eq!(resolve_mime(Some("image/png"), Some("text/plain"), "txt"), "image/png");
        assert_eq!(resolve_mime(None, Some("video/mp4"), "bin"), "video/mp4");
        assert_eq!(resolve_mime(None, Some("  "), "json"), "application/json");
        assert_eq!(resolve_mime(None, None, "weird"), OCTET_STREAM);
    }
}
