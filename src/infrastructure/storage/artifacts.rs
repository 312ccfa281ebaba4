use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, warn};

use crate::common::error::{AppError, AppResult};

const ALLOWED_EXTENSIONS: &[&str] = &["mp4", "avi", "mkv", "mov", "webm", "y4m"];
const SIDECAR_SUFFIX: &str = ".meta.json";

/// Metrics the pipeline leaves next to its output.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SidecarMetrics {
    pub avg_fps: f64,
    pub frames: u64,
}

/// Owns the upload and output directories and every file operation on job artifacts.
#[derive(Clone, Debug)]
pub struct ArtifactStore {
    upload_dir: PathBuf,
    output_dir: PathBuf,
}

impl ArtifactStore {
    pub async fn new(upload_dir: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> io::Result<Self> {
        let store = Self {
            upload_dir: upload_dir.into(),
            output_dir: output_dir.into(),
        };
        tokio::fs::create_dir_all(&store.upload_dir).await?;
        tokio::fs::create_dir_all(&store.output_dir).await?;

        info!(
            uploads = %store.upload_dir.display(),
            outputs = %store.output_dir.display(),
            "✅ Artifact store ready"
        );
        Ok(store)
    }

    /// Rejects anything that is not a bare file name with a known video extension.
    pub fn sanitize_file_name(name: &str) -> AppResult<String> {
        let name = name.trim();
        let mut components = Path::new(name).components();
        let valid_shape = matches!(
            (components.next(), components.next()),
            (Some(Component::Normal(_)), None)
        );
        let bad_char = name.chars().any(|c| c.is_control() || matches!(c, '/' | '\\' | '"'));
        if name.is_empty() || !valid_shape || bad_char || name.starts_with('.') {
            return Err(AppError::validation("invalid file name"));
        }

        let extension = Path::new(name)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();
        if !ALLOWED_EXTENSIONS.contains(&extension.as_str()) {
            return Err(AppError::validation(format!(
                "unsupported file extension; allowed: {}",
                ALLOWED_EXTENSIONS.join(", ")
            )));
        }

        Ok(name.to_string())
    }

    pub fn input_path(&self, file_name: &str) -> AppResult<PathBuf> {
        Ok(self.upload_dir.join(Self::sanitize_file_name(file_name)?))
    }

    /// `{stem}_{job}_interp_{fps}fps{ext}`, or `{stem}_{job}_interp{ext}` without a
    /// target rate. Job ids are unique in the table, so live outputs never share a path.
    pub fn output_path_for(&self, input: &Path, job_id: &str, target_fps: Option<u32>) -> PathBuf {
        let stem = input.file_stem().and_then(|s| s.to_str()).unwrap_or("output");
        let ext = input.extension().and_then(|e| e.to_str()).unwrap_or("mp4");
        let name = match target_fps {
            Some(fps) => format!("{}_{}_interp_{}fps.{}", stem, job_id, fps, ext),
            None => format!("{}_{}_interp.{}", stem, job_id, ext),
        };
        self.output_dir.join(name)
    }

    /// Sibling path used to stage a rewrite. Keeps the extension so external tools
    /// can infer the container.
    pub fn temp_path_for(path: &Path, tag: &str) -> PathBuf {
        let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("artifact");
        let name = match path.extension().and_then(|e| e.to_str()) {
            Some(ext) => format!("{}.tmp-{}.{}", stem, tag, ext),
            None => format!("{}.tmp-{}", stem, tag),
        };
        path.with_file_name(name)
    }

    pub fn sidecar_path(output: &Path) -> PathBuf {
        let mut name = output.file_name().unwrap_or_default().to_os_string();
        name.push(SIDECAR_SUFFIX);
        output.with_file_name(name)
    }

    pub fn write_sidecar(output: &Path, metrics: &SidecarMetrics) -> io::Result<()> {
        let path = Self::sidecar_path(output);
        let tmp = Self::temp_path_for(&path, "meta");
        fs::write(&tmp, serde_json::to_vec(metrics)?)?;
        Self::commit_replace(&tmp, &path)
    }

    pub fn read_sidecar(output: &Path) -> Option<SidecarMetrics> {
        let bytes = fs::read(Self::sidecar_path(output)).ok()?;
        match serde_json::from_slice(&bytes) {
            Ok(metrics) => Some(metrics),
            Err(e) => {
                warn!(output = %output.display(), error = %e, "Ignoring unreadable sidecar");
                None
            }
        }
    }

    /// Atomically moves a fully written file over `target`.
    pub fn commit_replace(tmp: &Path, target: &Path) -> io::Result<()> {
        fs::rename(tmp, target)
    }

    /// Idempotent delete. Returns whether a file was actually removed.
    pub fn delete(path: &Path) -> bool {
        match fs::remove_file(path) {
            Ok(()) => {
                debug!(path = %path.display(), "Deleted artifact");
                true
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => false,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to delete artifact");
                false
            }
        }
    }

    /// Deletes an output together with its sidecar.
    pub fn delete_output(output: &Path) -> bool {
        Self::delete(&Self::sidecar_path(output));
        Self::delete(output)
    }
}

/// Deletes the input artifact when dropped, whatever way the job body ends.
pub struct InputGuard {
    path: PathBuf,
}

impl InputGuard {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl Drop for InputGuard {
    fn drop(&mut self) {
        ArtifactStore::delete(&self.path);
    }
}
