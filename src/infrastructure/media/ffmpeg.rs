//! ffmpeg-backed codec: every non-y4m container is decoded and encoded by piping
//! YUV4MPEG2 through an ffmpeg child process.

use serde::Deserialize;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use std::process::{ChildStdin, ChildStdout, Command, Stdio};
use std::sync::Arc;
use tracing::debug;

use crate::common::cancel::{CancelSignal, ProcessHandle};

use super::codec::{FrameReader, FrameWriter, MediaCodec};
use super::error::{MediaError, MediaResult};
use super::frame::{Frame, StreamInfo};
use super::y4m::{Y4mReader, Y4mWriter};

#[derive(Debug, Clone)]
pub struct FfmpegCodec {
    ffmpeg: String,
    ffprobe: String,
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    streams: Vec<FfprobeStream>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    avg_frame_rate: Option<String>,
    nb_frames: Option<String>,
}

impl FfmpegCodec {
    pub fn new(ffmpeg: impl Into<String>, ffprobe: impl Into<String>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
        }
    }

    fn require(bin: &str) -> MediaResult<()> {
        which::which(bin)
            .map(|_| ())
            .map_err(|_| MediaError::ToolUnavailable(bin.to_string()))
    }
}

impl MediaCodec for FfmpegCodec {
    fn probe(&self, path: &Path) -> MediaResult<StreamInfo> {
        if !path.exists() {
            return Err(MediaError::FileNotFound(path.to_path_buf()));
        }
        Self::require(&self.ffprobe)?;

        let output = Command::new(&self.ffprobe)
            .args([
                "-v",
                "error",
                "-select_streams",
                "v:0",
                "-show_entries",
                "stream=width,height,r_frame_rate,avg_frame_rate,nb_frames",
                "-of",
                "json",
            ])
            .arg(path)
            .stdin(Stdio::null())
            .output()?;

        if !output.status.success() {
            return Err(MediaError::tool_failed(
                &self.ffprobe,
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
                output.status.code(),
            ));
        }

        let parsed: FfprobeOutput = serde_json::from_slice(&output.stdout)?;
        let stream = parsed
            .streams
            .into_iter()
            .next()
            .ok_or_else(|| MediaError::UnsupportedFormat("no video stream".to_string()))?;

        let fps = stream
            .avg_frame_rate
            .as_deref()
            .and_then(parse_ratio)
            .or_else(|| stream.r_frame_rate.as_deref().and_then(parse_ratio))
            .unwrap_or(30.0);

        Ok(StreamInfo {
            fps,
            width: stream.width.unwrap_or(0),
            height: stream.height.unwrap_or(0),
            frame_count: stream.nb_frames.and_then(|n| n.parse().ok()),
        })
    }

    fn open_reader(&self, path: &Path, cancel: &CancelSignal) -> MediaResult<Box<dyn FrameReader>> {
        if !path.exists() {
            return Err(MediaError::FileNotFound(path.to_path_buf()));
        }
        Self::require(&self.ffmpeg)?;
        let frame_count = self.probe(path).ok().and_then(|info| info.frame_count);

        debug!(path = %path.display(), "Spawning ffmpeg decoder");
        let mut child = Command::new(&self.ffmpeg)
            .args(["-v", "error", "-nostdin", "-i"])
            .arg(path)
            .args(["-f", "yuv4mpegpipe", "-pix_fmt", "yuv420p", "-"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| MediaError::tool_failed(&self.ffmpeg, "stdout not captured", None))?;
        let process = cancel.register(child);

        let mut inner = match Y4mReader::new(BufReader::new(stdout)) {
            Ok(inner) => inner,
            Err(e) => {
                process.kill();
                let _ = process.wait();
                return Err(e);
            }
        };
        inner.set_frame_count(frame_count);

        Ok(Box::new(FfmpegReader {
            tool: self.ffmpeg.clone(),
            inner,
            process,
            done: false,
        }))
    }

    fn open_writer(
        &self,
        path: &Path,
        info: &StreamInfo,
        cancel: &CancelSignal,
    ) -> MediaResult<Box<dyn FrameWriter>> {
        Self::require(&self.ffmpeg)?;

        debug!(path = %path.display(), fps = info.fps, "Spawning ffmpeg encoder");
        let mut child = Command::new(&self.ffmpeg)
            .args(["-y", "-v", "error", "-f", "yuv4mpegpipe", "-i", "-"])
            .args(video_codec_args(path))
            .args(["-pix_fmt", "yuv420p"])
            .arg(path)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| MediaError::tool_failed(&self.ffmpeg, "stdin not captured", None))?;
        let process = cancel.register(child);

        let inner = match Y4mWriter::new(BufWriter::new(stdin), info) {
            Ok(inner) => inner,
            Err(e) => {
                process.kill();
                let _ = process.wait();
                return Err(e);
            }
        };

        Ok(Box::new(FfmpegWriter {
            tool: self.ffmpeg.clone(),
            inner: Some(inner),
            process,
        }))
    }
}

struct FfmpegReader {
    tool: String,
    inner: Y4mReader<BufReader<ChildStdout>>,
    process: Arc<ProcessHandle>,
    done: bool,
}

impl FrameReader for FfmpegReader {
    fn info(&self) -> &StreamInfo {
        self.inner.info()
    }

    fn next_frame(&mut self) -> MediaResult<Option<Frame>> {
        if self.done {
            return Ok(None);
        }
        match self.inner.next_frame()? {
            Some(frame) => Ok(Some(frame)),
            None => {
                self.done = true;
                let status = self.process.wait()?;
                if status.success() {
                    Ok(None)
                } else {
                    Err(MediaError::tool_failed(&self.tool, "decoder exited with error", status.code()))
                }
            }
        }
    }
}

impl Drop for FfmpegReader {
    fn drop(&mut self) {
        if !self.done {
            self.process.kill();
            let _ = self.process.wait();
        }
    }
}

struct FfmpegWriter {
    tool: String,
    inner: Option<Y4mWriter<BufWriter<ChildStdin>>>,
    process: Arc<ProcessHandle>,
}

impl FrameWriter for FfmpegWriter {
    fn write_frame(&mut self, frame: &Frame) -> MediaResult<()> {
        match self.inner.as_mut() {
            Some(inner) => inner.write_frame(frame),
            None => Err(MediaError::tool_failed(&self.tool, "encoder already closed", None)),
        }
    }

    fn finish(mut self: Box<Self>) -> MediaResult<()> {
        if let Some(inner) = self.inner.take() {
            // closing stdin lets ffmpeg flush the container
            let stdin = inner.into_inner()?;
            drop(stdin.into_inner().map_err(|e| e.into_error())?);
        }
        let status = self.process.wait()?;
        if status.success() {
            Ok(())
        } else {
            Err(MediaError::tool_failed(&self.tool, "encoder exited with error", status.code()))
        }
    }
}

impl Drop for FfmpegWriter {
    fn drop(&mut self) {
        if self.inner.is_some() {
            self.process.kill();
            let _ = self.process.wait();
        }
    }
}

fn container(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default()
}

/// Video encoder arguments accepted by the muxer `path` implies.
/// WebM only carries VP8, VP9 or AV1.
pub fn video_codec_args(path: &Path) -> &'static [&'static str] {
    match container(path).as_str() {
        "webm" => &["-c:v", "libvpx-vp9", "-b:v", "0", "-crf", "32", "-row-mt", "1"],
        _ => &["-c:v", "mpeg4", "-q:v", "3"],
    }
}

/// Audio encoder arguments for `path`. WebM only carries Opus or Vorbis.
pub fn audio_codec_args(path: &Path) -> &'static [&'static str] {
    match container(path).as_str() {
        "webm" => &["-c:a", "libopus", "-b:a", "128k"],
        _ => &["-c:a", "aac", "-b:a", "128k"],
    }
}

fn parse_ratio(value: &str) -> Option<f64> {
    let (num, den) = value.split_once('/')?;
    let num: f64 = num.parse().ok()?;
    let den: f64 = den.parse().ok()?;
    (num > 0.0 && den > 0.0).then(|| num / den)
}
