//! Three-stage streaming frame pipeline.
//!
//! decode → synthesize → encode, each on a blocking thread, joined by bounded
//! channels. Every stage polls the job's cancel signal once per iteration and
//! forwards an `End` sentinel downstream when it stops cleanly.

use async_channel::{Receiver, Sender};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::common::cancel::CancelSignal;
use crate::infrastructure::media::{
    Frame, FrameInterpolator, FrameReader, FrameWriter, MediaCodec, MediaError, StreamInfo,
};
use crate::infrastructure::storage::artifacts::{ArtifactStore, SidecarMetrics};

pub type ProgressFn = Arc<dyn Fn(f32) + Send + Sync>;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("media error: {0}")]
    Media(#[from] MediaError),

    #[error("pipeline cancelled")]
    Cancelled,

    #[error("{stage} stage failed: {message}")]
    StageFailed { stage: &'static str, message: String },

    #[error("{0} channel closed unexpectedly")]
    ChannelClosed(&'static str),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

enum Packet {
    Frame(Frame),
    End,
}

#[derive(Debug, Clone, Copy)]
pub struct PipelineParams {
    /// Frames synthesized between every consecutive source pair.
    pub multiplier: u32,
    pub target_fps: Option<u32>,
}

impl PipelineParams {
    pub fn output_fps(&self, input_fps: f64) -> f64 {
        match self.target_fps {
            Some(fps) => fps as f64,
            None => input_fps * (self.multiplier + 1) as f64,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PipelineReport {
    pub source_frames: u64,
    pub frames: u64,
    pub avg_fps: f64,
    pub input: StreamInfo,
    pub output_fps: f64,
}

pub struct FramePipeline {
    codec: Arc<dyn MediaCodec>,
    interpolator: Arc<dyn FrameInterpolator>,
    queue_capacity: usize,
}

impl FramePipeline {
    pub fn new(
        codec: Arc<dyn MediaCodec>,
        interpolator: Arc<dyn FrameInterpolator>,
        queue_capacity: usize,
    ) -> Self {
        Self {
            codec,
            interpolator,
            queue_capacity: queue_capacity.max(1),
        }
    }

    /// Runs the pipeline to completion and leaves the sidecar metrics next to `output`.
    pub async fn run(
        &self,
        input: &Path,
        output: &Path,
        params: PipelineParams,
        cancel: &CancelSignal,
        progress: ProgressFn,
    ) -> Result<PipelineReport, PipelineError> {
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        let started = Instant::now();

        let (reader, writer, input_info, output_fps) = {
            let codec = self.codec.clone();
            let (input, output) = (input.to_path_buf(), output.to_path_buf());
            let cancel = cancel.clone();
            join("open", tokio::task::spawn_blocking(move || open(&*codec, &input, &output, params, &cancel)))
                .await??
        };

        info!(
            input = %input.display(),
            width = input_info.width,
            height = input_info.height,
            input_fps = input_info.fps,
            output_fps,
            multiplier = params.multiplier,
            "Starting frame pipeline"
        );

        let (decoded_tx, decoded_rx) = async_channel::bounded(self.queue_capacity);
        let (synth_tx, synth_rx) = async_channel::bounded(self.queue_capacity);

        let decode = {
            let cancel = cancel.clone();
            let total = input_info.frame_count;
            tokio::task::spawn_blocking(move || decode_stage(reader, decoded_tx, &cancel, total, progress))
        };
        let synthesize = {
            let cancel = cancel.clone();
            let interpolator = self.interpolator.clone();
            let k = params.multiplier;
            tokio::task::spawn_blocking(move || {
                synthesize_stage(&*interpolator, k, decoded_rx, synth_tx, &cancel)
            })
        };
        let encode = {
            let cancel = cancel.clone();
            tokio::task::spawn_blocking(move || encode_stage(writer, synth_rx, &cancel))
        };

        let results = (
            join("decode", decode).await,
            join("synthesize", synthesize).await,
            join("encode", encode).await,
        );

        if cancel.is_cancelled() {
            debug!(output = %output.display(), "Frame pipeline stopped by cancellation");
            return Err(PipelineError::Cancelled);
        }

        let (source_frames, frames) = match results {
            (Ok(Ok(source)), Ok(Ok(())), Ok(Ok(written))) => (source, written),
            (decode, synthesize, encode) => return Err(first_failure([
                decode.and_then(|r| r.map(|_| ())),
                synthesize.and_then(|r| r),
                encode.and_then(|r| r.map(|_| ())),
            ])),
        };

        let elapsed = started.elapsed();
        let secs = elapsed.as_secs_f64();
        let avg_fps = if secs > 0.0 { frames as f64 / secs } else { 0.0 };

        ArtifactStore::write_sidecar(output, &SidecarMetrics { avg_fps, frames })?;

        info!(
            output = %output.display(),
            frames,
            source_frames,
            elapsed_ms = elapsed.as_millis() as u64,
            avg_fps,
            "Frame pipeline finished"
        );

        Ok(PipelineReport {
            source_frames,
            frames,
            avg_fps,
            input: input_info,
            output_fps,
        })
    }
}

type Opened = (Box<dyn FrameReader>, Box<dyn FrameWriter>, StreamInfo, f64);

fn open(
    codec: &dyn MediaCodec,
    input: &Path,
    output: &Path,
    params: PipelineParams,
    cancel: &CancelSignal,
) -> Result<Opened, PipelineError> {
    let reader = codec.open_reader(input, cancel)?;
    let input_info = *reader.info();
    let output_fps = params.output_fps(input_info.fps);
    let output_info = StreamInfo {
        fps: output_fps,
        frame_count: None,
        ..input_info
    };
    let writer = codec.open_writer(output, &output_info, cancel)?;
    Ok((reader, writer, input_info, output_fps))
}

async fn join<T>(
    stage: &'static str,
    handle: JoinHandle<Result<T, PipelineError>>,
) -> Result<Result<T, PipelineError>, PipelineError> {
    handle.await.map_err(|e| PipelineError::StageFailed {
        stage,
        message: e.to_string(),
    })
}

/// Picks the root cause: a closed channel is only a symptom of another stage failing.
fn first_failure(results: [Result<(), PipelineError>; 3]) -> PipelineError {
    let mut closed = None;
    for result in results {
        match result {
            Err(PipelineError::ChannelClosed(stage)) => closed = closed.or(Some(stage)),
            Err(e) => return e,
            Ok(()) => {}
        }
    }
    PipelineError::ChannelClosed(closed.unwrap_or("pipeline"))
}

/// Returns the number of source frames read.
fn decode_stage(
    mut reader: Box<dyn FrameReader>,
    tx: Sender<Packet>,
    cancel: &CancelSignal,
    total: Option<u64>,
    progress: ProgressFn,
) -> Result<u64, PipelineError> {
    let mut consumed = 0u64;
    let mut reported = 0.0f32;

    loop {
        if cancel.is_cancelled() {
            break;
        }
        match reader.next_frame()? {
            Some(frame) => {
                consumed += 1;
                if tx.send_blocking(Packet::Frame(frame)).is_err() {
                    return Err(PipelineError::ChannelClosed("decode"));
                }
                if let Some(total) = total.filter(|t| *t > 0) {
                    let fraction = (consumed as f32 / total as f32).min(1.0);
                    if fraction - reported >= 0.01 || fraction >= 1.0 {
                        reported = fraction;
                        progress(fraction);
                    }
                }
            }
            None => break,
        }
    }

    let _ = tx.send_blocking(Packet::End);
    Ok(consumed)
}

fn synthesize_stage(
    interpolator: &dyn FrameInterpolator,
    k: u32,
    rx: Receiver<Packet>,
    tx: Sender<Packet>,
    cancel: &CancelSignal,
) -> Result<(), PipelineError> {
    let emit = |frame: Frame| {
        tx.send_blocking(Packet::Frame(frame))
            .map_err(|_| PipelineError::ChannelClosed("synthesize"))
    };
    let mut previous: Option<Frame> = None;

    loop {
        if cancel.is_cancelled() {
            break;
        }
        match rx.recv_blocking() {
            Ok(Packet::Frame(next)) => {
                if let Some(prev) = previous.take() {
                    emit(prev.clone())?;
                    for i in 1..=k {
                        if cancel.is_cancelled() {
                            break;
                        }
                        let t = i as f32 / (k + 1) as f32;
                        emit(interpolator.interpolate(&prev, &next, t)?)?;
                    }
                }
                previous = Some(next);
            }
            Ok(Packet::End) => {
                if let Some(last) = previous.take() {
                    emit(last)?;
                }
                break;
            }
            Err(_) => return Err(PipelineError::ChannelClosed("synthesize")),
        }
    }

    let _ = tx.send_blocking(Packet::End);
    Ok(())
}

/// Returns the number of frames written.
fn encode_stage(
    mut writer: Box<dyn FrameWriter>,
    rx: Receiver<Packet>,
    cancel: &CancelSignal,
) -> Result<u64, PipelineError> {
    let mut written = 0u64;

    loop {
        if cancel.is_cancelled() {
            // dropping the writer abandons the partial output
            return Ok(written);
        }
        match rx.recv_blocking() {
            Ok(Packet::Frame(frame)) => {
                writer.write_frame(&frame)?;
                written += 1;
            }
            Ok(Packet::End) => break,
            Err(_) => return Err(PipelineError::ChannelClosed("encode")),
        }
    }

    if cancel.is_cancelled() {
        return Ok(written);
    }
    writer.finish()?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::media::engine::BlendInterpolator;
    use crate::infrastructure::media::memory::MemoryCodec;
    use crate::infrastructure::media::MediaResult;
    use std::sync::Mutex;
    use std::time::Duration;

    fn pipeline(codec: &MemoryCodec) -> FramePipeline {
        FramePipeline::new(Arc::new(codec.clone()), Arc::new(BlendInterpolator::new(1.0)), 2)
    }

    fn no_progress() -> ProgressFn {
        Arc::new(|_: f32| {})
    }

    #[tokio::test]
    async fn ten_frames_with_multiplier_two_yield_twenty_eight() {
        let dir = tempfile::tempdir().unwrap();
        let (input, output) = (dir.path().join("in.y4m"), dir.path().join("out.y4m"));
        let codec = MemoryCodec::new();
        codec.add_source(&input, 10, 30.0);

        let params = PipelineParams { multiplier: 2, target_fps: None };
        let report = pipeline(&codec)
            .run(&input, &output, params, &CancelSignal::new(), no_progress())
            .await
            .unwrap();

        assert_eq!(report.source_frames, 10);
        assert_eq!(report.frames, 28);
        assert_eq!(report.output_fps, 90.0);

        let lumas: Vec<u8> = codec.written(&output).unwrap().iter().map(|f| f.luma()[0]).collect();
        assert_eq!(lumas.len(), 28);
        assert_eq!(&lumas[..4], &[0, 3, 7, 10]);
        assert_eq!(lumas[27], 90);
        // every original frame sits at a multiple of k + 1
        for (i, chunk) in lumas.chunks(3).enumerate() {
            assert_eq!(chunk[0], (i * 10) as u8);
        }

        let sidecar = ArtifactStore::read_sidecar(&output).unwrap();
        assert_eq!(sidecar.frames, 28);
    }

    #[tokio::test]
    async fn target_fps_overrides_derived_rate() {
        let dir = tempfile::tempdir().unwrap();
        let (input, output) = (dir.path().join("in.y4m"), dir.path().join("out.y4m"));
        let codec = MemoryCodec::new();
        codec.add_source(&input, 3, 24.0);

        let params = PipelineParams { multiplier: 1, target_fps: Some(60) };
        let report = pipeline(&codec)
            .run(&input, &output, params, &CancelSignal::new(), no_progress())
            .await
            .unwrap();

        assert_eq!(report.output_fps, 60.0);
        assert_eq!(report.frames, 5);
    }

    #[tokio::test]
    async fn empty_source_produces_empty_output() {
        let dir = tempfile::tempdir().unwrap();
        let (input, output) = (dir.path().join("in.y4m"), dir.path().join("out.y4m"));
        let codec = MemoryCodec::new();
        codec.add_source(&input, 0, 30.0);

        let params = PipelineParams { multiplier: 3, target_fps: None };
        let report = pipeline(&codec)
            .run(&input, &output, params, &CancelSignal::new(), no_progress())
            .await
            .unwrap();

        assert_eq!(report.frames, 0);
        assert_eq!(codec.written(&output).unwrap().len(), 0);
    }

    #[tokio::test]
    async fn single_frame_passes_through() {
        let dir = tempfile::tempdir().unwrap();
        let (input, output) = (dir.path().join("in.y4m"), dir.path().join("out.y4m"));
        let codec = MemoryCodec::new();
        codec.add_source(&input, 1, 30.0);

        let params = PipelineParams { multiplier: 4, target_fps: None };
        let report = pipeline(&codec)
            .run(&input, &output, params, &CancelSignal::new(), no_progress())
            .await
            .unwrap();

        assert_eq!(report.frames, 1);
    }

    #[tokio::test]
    async fn cancellation_stops_the_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        let (input, output) = (dir.path().join("in.y4m"), dir.path().join("out.y4m"));
        let codec = MemoryCodec::new().with_frame_delay(Duration::from_millis(20));
        codec.add_source(&input, 500, 30.0);

        let cancel = CancelSignal::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let params = PipelineParams { multiplier: 1, target_fps: None };
        let result = pipeline(&codec).run(&input, &output, params, &cancel, no_progress()).await;

        assert!(matches!(result, Err(PipelineError::Cancelled)));
        assert!(codec.written(&output).is_none());
        assert!(!ArtifactStore::sidecar_path(&output).exists());
    }

    #[tokio::test]
    async fn progress_is_reported_up_to_completion() {
        let dir = tempfile::tempdir().unwrap();
        let (input, output) = (dir.path().join("in.y4m"), dir.path().join("out.y4m"));
        let codec = MemoryCodec::new();
        codec.add_source(&input, 10, 30.0);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let progress: ProgressFn = Arc::new(move |p: f32| sink.lock().unwrap().push(p));

        let params = PipelineParams { multiplier: 1, target_fps: None };
        pipeline(&codec)
            .run(&input, &output, params, &CancelSignal::new(), progress)
            .await
            .unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 10);
        assert_eq!(*seen.last().unwrap(), 1.0);
    }

    struct FailingInterpolator;

    impl FrameInterpolator for FailingInterpolator {
        fn interpolate(&self, _a: &Frame, _b: &Frame, _t: f32) -> MediaResult<Frame> {
            Err(MediaError::UnsupportedFormat("synthetic failure".to_string()))
        }
    }

    #[tokio::test]
    async fn engine_failure_surfaces_as_root_cause() {
        let dir = tempfile::tempdir().unwrap();
        let (input, output) = (dir.path().join("in.y4m"), dir.path().join("out.y4m"));
        let codec = MemoryCodec::new();
        codec.add_source(&input, 50, 30.0);

        let pipeline = FramePipeline::new(Arc::new(codec.clone()), Arc::new(FailingInterpolator), 2);
        let params = PipelineParams { multiplier: 1, target_fps: None };
        let err = pipeline
            .run(&input, &output, params, &CancelSignal::new(), no_progress())
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::Media(MediaError::UnsupportedFormat(_))));
        assert!(codec.written(&output).is_none());
    }

    #[tokio::test]
    async fn missing_input_is_a_media_error() {
        let dir = tempfile::tempdir().unwrap();
        let codec = MemoryCodec::new();
        let params = PipelineParams { multiplier: 1, target_fps: None };
        let err = pipeline(&codec)
            .run(&dir.path().join("nope.y4m"), &dir.path().join("out.y4m"), params, &CancelSignal::new(), no_progress())
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::Media(MediaError::FileNotFound(_))));
    }
}
