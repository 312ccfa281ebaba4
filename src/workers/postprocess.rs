//! Best-effort post-processing of a finished output: audio remux and
//! playback-compatibility transcode. Every step stages into a temp sibling and
//! commits with an atomic rename; a failing step leaves the artifact untouched.

use async_trait::async_trait;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::common::cancel::CancelSignal;
use crate::infrastructure::media::ffmpeg::audio_codec_args;
use crate::infrastructure::media::{MediaCodec, MediaError};
use crate::infrastructure::storage::artifacts::ArtifactStore;

const WEB_CONTAINERS: &[&str] = &["mp4", "mov", "m4v", "mkv"];

#[derive(Debug, Error)]
pub enum PostProcessError {
    #[error("{backend} does not handle {path}")]
    Unsupported { backend: &'static str, path: PathBuf },

    #[error("{0} not found in PATH")]
    ToolUnavailable(String),

    #[error("{tool} exited with status {code:?}")]
    ToolFailed { tool: String, code: Option<i32> },

    #[error("terminated by cancellation")]
    Cancelled,

    #[error("media error: {0}")]
    Media(#[from] MediaError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Rewrites `source` into `dest` in a form browsers can play.
#[async_trait]
pub trait TranscodeBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn transcode(&self, source: &Path, dest: &Path, cancel: &CancelSignal) -> Result<(), PostProcessError>;
}

/// Writes `video` combined with the audio track of `audio_source` into `dest`.
#[async_trait]
pub trait AudioMuxer: Send + Sync {
    fn name(&self) -> &'static str;

    async fn mux(
        &self,
        video: &Path,
        audio_source: &Path,
        dest: &Path,
        cancel: &CancelSignal,
    ) -> Result<(), PostProcessError>;
}

fn extension(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default()
}

async fn run_tool(bin: &str, args: Vec<OsString>, cancel: &CancelSignal) -> Result<(), PostProcessError> {
    which::which(bin).map_err(|_| PostProcessError::ToolUnavailable(bin.to_string()))?;

    let mut child = Command::new(bin)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()?;

    tokio::select! {
        status = child.wait() => {
            let status = status?;
            if status.success() {
                Ok(())
            } else {
                Err(PostProcessError::ToolFailed { tool: bin.to_string(), code: status.code() })
            }
        }
        _ = cancel.terminated() => {
            let _ = child.kill().await;
            Err(PostProcessError::Cancelled)
        }
    }
}

/// H.264 yuv420p with the moov atom up front.
pub struct FfmpegTranscoder {
    bin: String,
}

impl FfmpegTranscoder {
    pub fn new(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }
}

#[async_trait]
impl TranscodeBackend for FfmpegTranscoder {
    fn name(&self) -> &'static str {
        "ffmpeg-h264"
    }

    async fn transcode(&self, source: &Path, dest: &Path, cancel: &CancelSignal) -> Result<(), PostProcessError> {
        if !WEB_CONTAINERS.contains(&extension(source).as_str()) {
            return Err(PostProcessError::Unsupported {
                backend: self.name(),
                path: source.to_path_buf(),
            });
        }

        let mut args: Vec<OsString> = vec!["-y".into(), "-v".into(), "error".into(), "-i".into()];
        args.push(source.into());
        args.extend(
            [
                "-c:v", "libx264", "-pix_fmt", "yuv420p", "-preset", "veryfast", "-crf", "23",
                "-movflags", "+faststart", "-c:a", "aac", "-b:a", "128k",
            ]
            .map(OsString::from),
        );
        args.push(dest.into());

        run_tool(&self.bin, args, cancel).await
    }
}

/// Fallback that decodes and re-encodes through the media codec. Audio is dropped.
pub struct CodecReencoder {
    codec: Arc<dyn MediaCodec>,
}

impl CodecReencoder {
    pub fn new(codec: Arc<dyn MediaCodec>) -> Self {
        Self { codec }
    }
}

#[async_trait]
impl TranscodeBackend for CodecReencoder {
    fn name(&self) -> &'static str {
        "codec-reencode"
    }

    async fn transcode(&self, source: &Path, dest: &Path, cancel: &CancelSignal) -> Result<(), PostProcessError> {
        if !WEB_CONTAINERS.contains(&extension(source).as_str()) {
            return Err(PostProcessError::Unsupported {
                backend: self.name(),
                path: source.to_path_buf(),
            });
        }

        let codec = self.codec.clone();
        let (source, dest) = (source.to_path_buf(), dest.to_path_buf());
        let cancel = cancel.clone();

        tokio::task::spawn_blocking(move || -> Result<(), PostProcessError> {
            let mut reader = codec.open_reader(&source, &cancel)?;
            let info = *reader.info();
            let mut writer = codec.open_writer(&dest, &info, &cancel)?;
            while let Some(frame) = reader.next_frame()? {
                if cancel.is_cancelled() {
                    return Err(PostProcessError::Cancelled);
                }
                writer.write_frame(&frame)?;
            }
            writer.finish()?;
            Ok(())
        })
        .await
        .map_err(|e| PostProcessError::Io(std::io::Error::other(e.to_string())))?
    }
}

/// Copies the video stream and re-encodes the first audio track, if any, to AAC.
pub struct FfmpegMuxer {
    bin: String,
}

impl FfmpegMuxer {
    pub fn new(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }
}

#[async_trait]
impl AudioMuxer for FfmpegMuxer {
    fn name(&self) -> &'static str {
        "ffmpeg-mux"
    }

    async fn mux(
        &self,
        video: &Path,
        audio_source: &Path,
        dest: &Path,
        cancel: &CancelSignal,
    ) -> Result<(), PostProcessError> {
        // raw y4m streams carry no audio track
        for path in [video, audio_source] {
            if extension(path) == "y4m" {
                return Err(PostProcessError::Unsupported {
                    backend: self.name(),
                    path: path.to_path_buf(),
                });
            }
        }

        let mut args: Vec<OsString> = vec!["-y".into(), "-v".into(), "error".into(), "-i".into()];
        args.push(video.into());
        args.push("-i".into());
        args.push(audio_source.into());
        args.extend(["-map", "0:v:0", "-map", "1:a:0?", "-c:v", "copy"].map(OsString::from));
        args.extend(audio_codec_args(dest).iter().copied().map(OsString::from));
        args.push("-shortest".into());
        args.push(dest.into());

        run_tool(&self.bin, args, cancel).await
    }
}

/// Runs the remux and transcode fallback chains against an output artifact.
pub struct PostProcessor {
    transcoders: Vec<Arc<dyn TranscodeBackend>>,
    muxers: Vec<Arc<dyn AudioMuxer>>,
}

impl PostProcessor {
    pub fn new(transcoders: Vec<Arc<dyn TranscodeBackend>>, muxers: Vec<Arc<dyn AudioMuxer>>) -> Self {
        Self { transcoders, muxers }
    }

    /// ffmpeg first, then the in-process re-encode.
    pub fn standard(ffmpeg_bin: &str, codec: Arc<dyn MediaCodec>) -> Self {
        Self::new(
            vec![
                Arc::new(FfmpegTranscoder::new(ffmpeg_bin)),
                Arc::new(CodecReencoder::new(codec)),
            ],
            vec![Arc::new(FfmpegMuxer::new(ffmpeg_bin))],
        )
    }

    /// Puts the original audio back into `output`. Returns whether it was committed.
    pub async fn remux_audio(&self, output: &Path, original: &Path, cancel: &CancelSignal) -> bool {
        let tmp = ArtifactStore::temp_path_for(output, "audio");
        for muxer in &self.muxers {
            if cancel.is_cancelled() {
                break;
            }
            match muxer.mux(output, original, &tmp, cancel).await {
                Ok(()) => return commit(&tmp, output, muxer.name()),
                Err(e) => {
                    warn!(backend = muxer.name(), output = %output.display(), error = %e, "Audio remux failed");
                    ArtifactStore::delete(&tmp);
                }
            }
        }
        false
    }

    /// Makes `output` browser-playable. Returns whether a rewrite was committed.
    pub async fn ensure_playable(&self, output: &Path, cancel: &CancelSignal) -> bool {
        let tmp = ArtifactStore::temp_path_for(output, "web");
        for backend in &self.transcoders {
            if cancel.is_cancelled() {
                break;
            }
            match backend.transcode(output, &tmp, cancel).await {
                Ok(()) => return commit(&tmp, output, backend.name()),
                Err(PostProcessError::Unsupported { .. }) => {
                    debug!(backend = backend.name(), output = %output.display(), "Transcode backend skipped");
                }
                Err(e) => {
                    warn!(backend = backend.name(), output = %output.display(), error = %e, "Playback transcode failed");
                    ArtifactStore::delete(&tmp);
                }
            }
        }
        false
    }

    pub async fn run(&self, output: &Path, original: &Path, keep_audio: bool, cancel: &CancelSignal) {
        if keep_audio {
            self.remux_audio(output, original, cancel).await;
        }
        self.ensure_playable(output, cancel).await;
    }
}

fn commit(tmp: &Path, output: &Path, backend: &'static str) -> bool {
    match ArtifactStore::commit_replace(tmp, output) {
        Ok(()) => {
            info!(backend, output = %output.display(), "✅ Post-processing step committed");
            true
        }
        Err(e) => {
            warn!(backend, output = %output.display(), error = %e, "Failed to commit post-processed artifact");
            ArtifactStore::delete(tmp);
            false
        }
    }
}
