use axum::{
    body::Body,
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use std::io::SeekFrom;
use std::path::Path;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;

/// Byte window selected by a `Range` header, inclusive on both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteRange {
    Full,
    Partial { start: u64, end: u64 },
    Unsatisfiable,
}

/// Resolves a single `bytes=` range against a file of `total` bytes.
/// Multi-range requests are not supported and are treated as unsatisfiable.
pub fn resolve_range(header: Option<&str>, total: u64) -> ByteRange {
    let Some(value) = header else {
        return ByteRange::Full;
    };
    let Some(spec) = value.trim().strip_prefix("bytes=") else {
        return ByteRange::Unsatisfiable;
    };
    if spec.contains(',') || total == 0 {
        return ByteRange::Unsatisfiable;
    }
    let Some((start, end)) = spec.trim().split_once('-') else {
        return ByteRange::Unsatisfiable;
    };
    let last = total - 1;

    match (start.trim(), end.trim()) {
        // suffix: the final N bytes
        ("", suffix) => match suffix.parse::<u64>() {
            Ok(n) if n > 0 => ByteRange::Partial {
                start: total.saturating_sub(n),
                end: last,
            },
            _ => ByteRange::Unsatisfiable,
        },
        (start, "") => match start.parse::<u64>() {
            Ok(start) if start <= last => ByteRange::Partial { start, end: last },
            _ => ByteRange::Unsatisfiable,
        },
        (start, end) => match (start.parse::<u64>(), end.parse::<u64>()) {
            (Ok(start), Ok(end)) if start <= end && start <= last => ByteRange::Partial {
                start,
                end: end.min(last),
            },
            _ => ByteRange::Unsatisfiable,
        },
    }
}

/// `inline` or `attachment` disposition with the file name as a quoted string.
fn content_disposition(download: bool, file_name: &str) -> String {
    let kind = if download { "attachment" } else { "inline" };
    let mut quoted = String::with_capacity(file_name.len());
    for c in file_name.chars().filter(|c| !c.is_control()) {
        if matches!(c, '"' | '\\') {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    format!("{}; filename=\"{}\"", kind, quoted)
}

/// Streams `path` (of `size` bytes) honouring the request's `Range` header.
/// Only the requested window is read from disk.
pub async fn serve_file(
    path: &Path,
    size: u64,
    headers: &HeaderMap,
    content_type: &str,
    file_name: &str,
    download: bool,
) -> Response {
    let range_header = headers.get(header::RANGE).and_then(|h| h.to_str().ok());

    let (status, start, len) = match resolve_range(range_header, size) {
        ByteRange::Full => (StatusCode::OK, 0, size),
        ByteRange::Partial { start, end } => (StatusCode::PARTIAL_CONTENT, start, end - start + 1),
        ByteRange::Unsatisfiable => {
            return (
                StatusCode::RANGE_NOT_SATISFIABLE,
                [(header::CONTENT_RANGE, format!("bytes */{}", size))],
            )
                .into_response();
        }
    };

    let mut file = match tokio::fs::File::open(path).await {
        Ok(f) => f,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Result file vanished before streaming");
            return StatusCode::NOT_FOUND.into_response();
        }
    };
    if start > 0 {
        if let Err(e) = file.seek(SeekFrom::Start(start)).await {
            tracing::error!("Seek Error: {}", e);
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    }

    let stream = ReaderStream::new(file.take(len));

    let mut builder = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CONTENT_LENGTH, len)
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::CACHE_CONTROL, "no-store");

    if let Ok(value) = HeaderValue::from_str(&content_disposition(download, file_name)) {
        builder = builder.header(header::CONTENT_DISPOSITION, value);
    }
    if status == StatusCode::PARTIAL_CONTENT {
        builder = builder.header(
            header::CONTENT_RANGE,
            format!("bytes {}-{}/{}", start, start + len - 1, size),
        );
    }

    builder
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}
