use anyhow::{anyhow, Result};
use axum::{body::Bytes, extract::multipart::Field};
use futures_util::StreamExt;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{error, info};

use crate::infrastructure::storage::artifacts::ArtifactStore;

/// Streams an upload into a temporary file next to its destination and renames it
/// into place once complete, so a half-written upload is never visible under the
/// final name.
pub struct FileUploader {
    dest: PathBuf,
    tmp: PathBuf,
    writer: BufWriter<File>,
    written: usize,
    max_bytes: usize,
}

impl FileUploader {
    pub async fn new(dest: PathBuf, max_bytes: usize) -> Result<Self> {
        let tmp = ArtifactStore::temp_path_for(&dest, "upload");
        let file = File::create(&tmp)
            .await
            .map_err(|e| anyhow!("Failed to create upload file: {}", e))?;

        Ok(Self {
            dest,
            tmp,
            writer: BufWriter::new(file),
            written: 0,
            max_bytes,
        })
    }

    pub async fn write_chunk(&mut self, chunk: Bytes) -> Result<()> {
        self.written += chunk.len();
        if self.written > self.max_bytes {
            return Err(anyhow!("Upload exceeds the limit of {} bytes", self.max_bytes));
        }

        self.writer
            .write_all(&chunk)
            .await
            .map_err(|e| anyhow!("Failed to write upload: {}", e))
    }

    pub async fn finish(mut self) -> Result<u64> {
        self.writer.flush().await?;
        self.writer.get_mut().sync_all().await?;
        drop(self.writer);

        tokio::fs::rename(&self.tmp, &self.dest)
            .await
            .map_err(|e| anyhow!("Failed to commit upload: {}", e))?;
        Ok(self.written as u64)
    }

    pub async fn abort(self) {
        drop(self.writer);
        let tmp = self.tmp;
        let _ = tokio::task::spawn_blocking(move || ArtifactStore::delete(&tmp)).await;
    }
}

fn accepts_content_type(content_type: &str) -> bool {
    content_type.starts_with("video/") || content_type == mime::APPLICATION_OCTET_STREAM.as_ref()
}

/// Copies a multipart field to `dest` chunk by chunk.
pub async fn stream_to_file(mut field: Field<'_>, dest: &Path, max_bytes: usize) -> Result<u64> {
    let content_type = field
        .content_type()
        .unwrap_or(mime::APPLICATION_OCTET_STREAM.as_ref())
        .to_string();

    if !accepts_content_type(&content_type) {
        return Err(anyhow!("Invalid content type: only video/* uploads are allowed"));
    }

    let mut uploader = FileUploader::new(dest.to_path_buf(), max_bytes).await?;

    while let Some(chunk) = field.next().await {
        let chunk = match chunk {
            Ok(c) => c,
            Err(e) => {
                error!("Stream error: {}", e);
                uploader.abort().await;
                return Err(anyhow!("Stream interrupted"));
            }
        };

        if let Err(e) = uploader.write_chunk(chunk).await {
            error!("Upload error: {}", e);
            uploader.abort().await;
            return Err(e);
        }
    }

    let size = uploader.finish().await?;
    info!(path = %dest.display(), bytes = size, "📦 Upload stored");
    Ok(size)
}
