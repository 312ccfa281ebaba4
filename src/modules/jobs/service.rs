use rand::distr::{Alphanumeric, SampleString};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tracing::{debug, error, info, warn};
use url::Url;
use uuid::Uuid;
use validator::Validate;

use super::dto::{HealthResponse, JobCreatedResponse, JobOptions, JobResponse};
use super::model::{find_preset, Job, JobMetrics, JobParams, JobStage, JobStatus, Preset, PRESETS};
use super::repository::JobTable;
use crate::common::cancel::CancelSignal;
use crate::common::error::{AppError, AppResult};
use crate::config::settings::AppConfig;
use crate::infrastructure::media::engine::blend_factory;
use crate::infrastructure::media::ffmpeg::FfmpegCodec;
use crate::infrastructure::media::{ContainerCodec, InterpolatorFactory, MediaCodec};
use crate::infrastructure::storage::artifacts::{ArtifactStore, InputGuard};
use crate::workers::pipeline::{FramePipeline, PipelineError, PipelineParams, ProgressFn};
use crate::workers::postprocess::PostProcessor;
use crate::workers::scheduler::WorkerPool;

pub const ALLOWED_MULTIPLIERS: [u32; 4] = [1, 2, 3, 4];
pub const MIN_DOWNSCALE: f32 = 0.1;
const TOKEN_LEN: usize = 24;

// Progress bands reported while a job runs.
const PROGRESS_STARTING: f32 = 0.05;
const PROGRESS_PIPELINE_START: f32 = 0.1;
const PROGRESS_PIPELINE_SPAN: f32 = 0.75;
const PROGRESS_FINALIZING: f32 = 0.9;

#[derive(Debug, Clone)]
pub struct JobSettings {
    pub ttl: Duration,
    pub max_active_jobs: usize,
    pub max_output_fps: u32,
    pub queue_capacity: usize,
    pub cancel_grace: Duration,
    pub public_base_url: Option<Url>,
}

impl JobSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        let public_base_url = match Url::parse(&config.public_base_url) {
            Ok(url) => Some(url),
            Err(e) => {
                warn!(url = %config.public_base_url, error = %e, "Invalid PUBLIC_BASE_URL, result links disabled");
                None
            }
        };

        Self {
            ttl: config.job_ttl(),
            max_active_jobs: config.max_active_jobs,
            max_output_fps: config.max_output_fps,
            queue_capacity: config.pipeline_queue_capacity,
            cancel_grace: config.cancel_grace(),
            public_base_url,
        }
    }
}

/// A completed output ready to be streamed.
#[derive(Debug, Clone)]
pub struct ResultHandle {
    pub path: PathBuf,
    pub size: u64,
    pub content_type: String,
    pub file_name: String,
}

enum Outcome {
    Completed(JobMetrics),
    Cancelled,
    Failed(String),
}

struct Inner {
    table: JobTable,
    store: ArtifactStore,
    pool: WorkerPool,
    codec: Arc<dyn MediaCodec>,
    interpolators: InterpolatorFactory,
    postprocess: PostProcessor,
    settings: JobSettings,
}

/// Owns the job lifecycle: admission, scheduling, state transitions, cancellation
/// and expiry.
#[derive(Clone)]
pub struct JobManager {
    inner: Arc<Inner>,
}

impl JobManager {
    pub fn new(
        settings: JobSettings,
        table: JobTable,
        store: ArtifactStore,
        pool: WorkerPool,
        codec: Arc<dyn MediaCodec>,
        interpolators: InterpolatorFactory,
        postprocess: PostProcessor,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                table,
                store,
                pool,
                codec,
                interpolators,
                postprocess,
                settings,
            }),
        }
    }

    /// Wires the production codec, engine and post-processing chain.
    pub async fn from_config(config: &AppConfig) -> std::io::Result<Self> {
        let store = ArtifactStore::new(config.upload_dir.clone(), config.output_dir.clone()).await?;
        let codec = ContainerCodec::new(FfmpegCodec::new(&config.ffmpeg_bin, &config.ffprobe_bin)).shared();
        let postprocess = PostProcessor::standard(&config.ffmpeg_bin, codec.clone());

        info!(
            workers = config.max_workers,
            max_active = config.max_active_jobs,
            ttl_secs = config.job_ttl_seconds,
            "✅ Job manager ready"
        );

        Ok(Self::new(
            JobSettings::from_config(config),
            JobTable::new(),
            store,
            WorkerPool::new(config.max_workers),
            codec,
            blend_factory(),
            postprocess,
        ))
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.inner.store
    }

    pub fn list_presets(&self) -> Vec<Preset> {
        PRESETS.to_vec()
    }

    pub fn health(&self) -> HealthResponse {
        HealthResponse {
            status: "ok".to_string(),
            active_jobs: self.inner.table.active_count(),
            workers: self.inner.pool.size(),
            idle_workers: self.inner.pool.idle_workers(),
        }
    }

    /// Validates, admits and schedules a job for a file already in the upload directory.
    pub async fn submit(&self, input_name: &str, options: JobOptions) -> AppResult<JobCreatedResponse> {
        options.validate()?;
        let params = self.resolve_params(&options)?;

        let input_path = self.inner.store.input_path(input_name)?;
        if !tokio::fs::try_exists(&input_path).await.unwrap_or(false) {
            return Err(AppError::not_found("input file not found in upload directory"));
        }
        if params.target_fps.is_none() {
            self.check_derived_rate(&input_path, params.multiplier).await?;
        }

        let id = options.id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let token = options.token.unwrap_or_else(generate_token);
        let ttl = options
            .ttl_seconds
            .map(Duration::from_secs)
            .unwrap_or(self.inner.settings.ttl);
        let output_path = self.inner.store.output_path_for(&input_path, &id, params.target_fps);

        let job = Job::new(id.clone(), token.clone(), params, input_path, output_path, ttl);
        let response = self.view(&job);
        self.inner.table.admit(job, self.inner.settings.max_active_jobs)?;

        info!(
            job_id = %id,
            input = input_name,
            multiplier = response.params.multiplier,
            target_fps = ?response.params.target_fps,
            "📥 Job queued"
        );
        self.schedule(id);

        Ok(JobCreatedResponse { token, job: response })
    }

    pub fn query(&self, id: &str, token: Option<&str>) -> AppResult<JobResponse> {
        let now = OffsetDateTime::now_utc();
        self.inner
            .table
            .with_job(id, |job| {
                authorize(job, token)?;
                if job.is_expired(now) {
                    return Err(job_not_found());
                }
                Ok(self.view(job))
            })
            .unwrap_or_else(|| Err(job_not_found()))
    }

    /// Marks the job Canceled right away; the pipeline notices cooperatively and
    /// external processes are killed once the grace period runs out.
    pub fn cancel(&self, id: &str, token: Option<&str>) -> AppResult<JobResponse> {
        let now = OffsetDateTime::now_utc();
        let (response, cleanup) = self
            .inner
            .table
            .with_job(id, |job| {
                authorize(job, token)?;
                if job.is_expired(now) {
                    return Err(job_not_found());
                }

                let mut cleanup = None;
                if job.transition(JobStatus::Canceled) {
                    job.stage = JobStage::Canceled;
                    job.output_deleted = true;
                    job.cancel.cancel();
                    cleanup = Some((job.cancel.clone(), job.input_path.clone(), job.output_path.clone()));
                }
                Ok((self.view(job), cleanup))
            })
            .unwrap_or_else(|| Err(job_not_found()))?;

        if let Some((signal, input, output)) = cleanup {
            info!(job_id = %id, "🛑 Job canceled");
            self.schedule_cleanup(signal, input, output);
        }
        Ok(response)
    }

    pub async fn fetch_result(&self, id: &str, token: Option<&str>) -> AppResult<ResultHandle> {
        let now = OffsetDateTime::now_utc();
        let path = self
            .inner
            .table
            .with_job(id, |job| {
                authorize(job, token)?;
                if job.is_expired(now) {
                    return Err(AppError::Gone);
                }
                if job.status != JobStatus::Completed {
                    return Err(AppError::NotReady);
                }
                if job.output_deleted {
                    return Err(AppError::not_found("result file not found"));
                }
                Ok(job.output_path.clone())
            })
            .unwrap_or_else(|| Err(job_not_found()))?;

        let meta = match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => meta,
            _ => return Err(AppError::not_found("result file not found")),
        };

        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("result")
            .to_string();
        let content_type = mime_guess::from_path(&path).first_or_octet_stream().to_string();

        Ok(ResultHandle {
            path,
            size: meta.len(),
            content_type,
            file_name,
        })
    }

    /// Deletes the artifacts of every expired job and drops its record.
    /// Still-running expired jobs are terminated first.
    pub fn sweep_expired(&self) -> usize {
        let now = OffsetDateTime::now_utc();
        let removed = self.inner.table.sweep(now, |job| {
            if !job.status.is_terminal() {
                job.cancel.terminate();
            }
            ArtifactStore::delete(&job.input_path);
            ArtifactStore::delete_output(&job.output_path);
            debug!(job_id = %job.id, status = %job.status, "Purged expired job");
        });

        if removed > 0 {
            info!(removed, "🧹 Purged expired jobs");
        }
        removed
    }

    fn resolve_params(&self, options: &JobOptions) -> AppResult<JobParams> {
        let mut params = JobParams::default();

        if let Some(name) = options.preset.as_deref() {
            let preset = find_preset(name).ok_or_else(|| AppError::validation(format!("unknown preset '{}'", name)))?;
            params.multiplier = preset.multiplier;
            params.target_fps = preset.target_fps;
            params.downscale = preset.downscale;
            params.preset = Some(preset.name.to_string());
        }

        if let Some(multiplier) = options.multiplier {
            params.multiplier = multiplier;
        }
        if let Some(target_fps) = options.target_fps {
            params.target_fps = Some(target_fps);
        }
        if let Some(downscale) = options.downscale {
            params.downscale = downscale;
        }
        if let Some(keep_audio) = options.keep_audio {
            params.keep_audio = keep_audio;
        }

        validate_params(&params, self.inner.settings.max_output_fps)?;
        Ok(params)
    }

    /// Without an explicit target the output rate follows the input rate, so the
    /// input has to be probed before admission.
    async fn check_derived_rate(&self, input: &Path, multiplier: u32) -> AppResult<()> {
        let codec = self.inner.codec.clone();
        let path = input.to_path_buf();
        let max = self.inner.settings.max_output_fps;

        match tokio::task::spawn_blocking(move || codec.probe(&path)).await {
            Ok(Ok(info)) => {
                let derived = info.fps * (multiplier + 1) as f64;
                if derived > max as f64 {
                    return Err(AppError::invalid_combination(format!(
                        "derived output rate {:.2} fps exceeds the maximum of {} fps; set target_fps",
                        derived, max
                    )));
                }
                Ok(())
            }
            Ok(Err(e)) => {
                warn!(input = %input.display(), error = %e, "Could not probe input, skipping derived rate check");
                Ok(())
            }
            Err(e) => Err(AppError::Processing(format!("probe task failed: {}", e))),
        }
    }

    fn schedule(&self, id: String) {
        let manager = self.clone();
        self.inner.pool.spawn(id.clone(), async move {
            manager.execute(id).await;
        });
    }

    async fn execute(&self, id: String) {
        let claimed = self
            .inner
            .table
            .with_job(&id, |job| {
                if !job.transition(JobStatus::Processing) {
                    return None;
                }
                job.set_progress(JobStage::Starting, PROGRESS_STARTING);
                Some((
                    job.input_path.clone(),
                    job.output_path.clone(),
                    job.params.clone(),
                    job.cancel.clone(),
                ))
            })
            .flatten();

        let Some((input, output, params, cancel)) = claimed else {
            debug!(job_id = %id, "Job no longer runnable, skipping");
            return;
        };

        let _input = InputGuard::new(input.clone());
        info!(job_id = %id, "⚙️ Job started");

        // a panicking body only fails its own job
        let body = {
            let (runner, id, output) = (self.clone(), id.clone(), output.clone());
            tokio::spawn(async move { runner.run(&id, &input, &output, &params, &cancel).await })
        };
        let outcome = match body.await {
            Ok(outcome) => outcome,
            Err(e) => Outcome::Failed(format!("job worker crashed: {}", e)),
        };

        self.finish(&id, &output, outcome);
    }

    async fn run(
        &self,
        id: &str,
        input: &Path,
        output: &Path,
        params: &JobParams,
        cancel: &CancelSignal,
    ) -> Outcome {
        self.update_progress(id, JobStage::Interpolating, PROGRESS_PIPELINE_START);

        let interpolator = (self.inner.interpolators)(params.downscale);
        let pipeline = FramePipeline::new(self.inner.codec.clone(), interpolator, self.inner.settings.queue_capacity);
        let progress: ProgressFn = {
            let manager = self.clone();
            let id = id.to_string();
            Arc::new(move |fraction: f32| {
                manager.update_progress(
                    &id,
                    JobStage::Interpolating,
                    PROGRESS_PIPELINE_START + fraction * PROGRESS_PIPELINE_SPAN,
                );
            })
        };
        let pipeline_params = PipelineParams {
            multiplier: params.multiplier,
            target_fps: params.target_fps,
        };

        let report = match pipeline.run(input, output, pipeline_params, cancel, progress).await {
            Ok(report) => report,
            Err(PipelineError::Cancelled) => return Outcome::Cancelled,
            Err(e) => return Outcome::Failed(e.to_string()),
        };

        let sidecar = ArtifactStore::read_sidecar(output);
        let metrics = JobMetrics {
            avg_fps: sidecar.map_or(report.avg_fps, |s| s.avg_fps),
            frames: sidecar.map_or(report.frames, |s| s.frames),
            input_fps: report.input.fps,
            output_fps: report.output_fps,
            width: report.input.width,
            height: report.input.height,
        };

        self.update_progress(id, JobStage::Finalizing, PROGRESS_FINALIZING);
        self.inner
            .postprocess
            .run(output, input, params.keep_audio, cancel)
            .await;

        if cancel.is_cancelled() {
            return Outcome::Cancelled;
        }
        Outcome::Completed(metrics)
    }

    fn finish(&self, id: &str, output: &Path, outcome: Outcome) {
        match outcome {
            Outcome::Completed(metrics) => {
                let committed = self
                    .inner
                    .table
                    .with_job(id, |job| {
                        if !job.transition(JobStatus::Completed) {
                            return false;
                        }
                        job.set_progress(JobStage::Done, 1.0);
                        job.metrics = Some(metrics);
                        true
                    })
                    .unwrap_or(false);

                if committed {
                    info!(job_id = %id, frames = metrics.frames, avg_fps = metrics.avg_fps, "✅ Job completed");
                } else {
                    // canceled or purged while finishing
                    self.discard_output(id, output);
                }
            }
            Outcome::Cancelled => {
                debug!(job_id = %id, "Job body observed cancellation");
                self.discard_output(id, output);
            }
            Outcome::Failed(message) => {
                error!(job_id = %id, error = %message, "❌ Job failed");
                self.inner.table.with_job(id, |job| {
                    if job.transition(JobStatus::Failed) {
                        job.stage = JobStage::Failed;
                        job.message = Some(message);
                    }
                });
                self.discard_output(id, output);
            }
        }
    }

    fn discard_output(&self, id: &str, output: &Path) {
        ArtifactStore::delete_output(output);
        self.inner.table.with_job(id, |job| job.output_deleted = true);
    }

    fn update_progress(&self, id: &str, stage: JobStage, progress: f32) {
        self.inner.table.with_job(id, |job| {
            if job.status == JobStatus::Processing {
                job.set_progress(stage, progress);
            }
        });
    }

    /// Deletes the artifacts now, then escalates to forced termination after the
    /// grace period and deletes again in case a process was still writing.
    fn schedule_cleanup(&self, signal: CancelSignal, input: PathBuf, output: PathBuf) {
        let grace = self.inner.settings.cancel_grace;
        tokio::spawn(async move {
            purge(input.clone(), output.clone()).await;
            tokio::time::sleep(grace).await;
            signal.terminate();
            purge(input, output).await;
        });
    }

    fn view(&self, job: &Job) -> JobResponse {
        JobResponse {
            id: job.id.clone(),
            status: job.status,
            stage: job.stage,
            progress: job.progress,
            message: job.message.clone(),
            params: job.params.clone(),
            metrics: job.metrics,
            result_url: if job.has_result() { self.result_url(job) } else { None },
            created_at: job.created_at,
            updated_at: job.updated_at,
            expires_at: job.expires_at,
        }
    }

    fn result_url(&self, job: &Job) -> Option<String> {
        let mut url = self.inner.settings.public_base_url.clone()?;
        url.path_segments_mut()
            .ok()?
            .pop_if_empty()
            .extend(["api", "v1", "jobs", job.id.as_str(), "result"]);
        url.query_pairs_mut().append_pair("token", &job.token);
        Some(url.to_string())
    }
}

pub fn validate_params(params: &JobParams, max_output_fps: u32) -> AppResult<()> {
    if !ALLOWED_MULTIPLIERS.contains(&params.multiplier) {
        return Err(AppError::invalid_combination(format!(
            "multiplier must be one of {:?}",
            ALLOWED_MULTIPLIERS
        )));
    }
    if !(MIN_DOWNSCALE..=1.0).contains(&params.downscale) {
        return Err(AppError::invalid_combination(format!(
            "downscale must be between {} and 1.0",
            MIN_DOWNSCALE
        )));
    }
    if let Some(fps) = params.target_fps {
        if fps == 0 || fps > max_output_fps {
            return Err(AppError::invalid_combination(format!(
                "target_fps must be between 1 and {}",
                max_output_fps
            )));
        }
    }
    Ok(())
}

fn authorize(job: &Job, token: Option<&str>) -> AppResult<()> {
    if job.token_matches(token) {
        Ok(())
    } else {
        Err(AppError::Forbidden)
    }
}

fn job_not_found() -> AppError {
    AppError::not_found("job not found")
}

fn generate_token() -> String {
    Alphanumeric.sample_string(&mut rand::rng(), TOKEN_LEN)
}

async fn purge(input: PathBuf, output: PathBuf) {
    let result = tokio::task::spawn_blocking(move || {
        ArtifactStore::delete(&input);
        ArtifactStore::delete_output(&output);
    })
    .await;
    if let Err(e) = result {
        warn!(error = %e, "Artifact cleanup task failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::media::engine::BlendInterpolator;
    use crate::infrastructure::media::memory::MemoryCodec;
    use crate::infrastructure::media::y4m::Y4mCodec;
    use crate::infrastructure::media::{Frame, FrameInterpolator, MediaError, MediaResult, StreamInfo};
    use crate::workers::sweeper::start_sweeper;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    struct Harness {
        _dir: TempDir,
        config: AppConfig,
        manager: JobManager,
    }

    async fn harness_with(
        codec: Arc<dyn MediaCodec>,
        interpolators: InterpolatorFactory,
        postprocess: PostProcessor,
    ) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::for_tests(dir.path());
        let store = ArtifactStore::new(config.upload_dir.clone(), config.output_dir.clone())
            .await
            .unwrap();
        let manager = JobManager::new(
            JobSettings::from_config(&config),
            JobTable::new(),
            store,
            WorkerPool::new(config.max_workers),
            codec,
            interpolators,
            postprocess,
        );
        Harness { _dir: dir, config, manager }
    }

    async fn harness(codec: &MemoryCodec) -> Harness {
        harness_with(Arc::new(codec.clone()), blend_factory(), PostProcessor::new(vec![], vec![])).await
    }

    impl Harness {
        fn add_input(&self, codec: &MemoryCodec, name: &str, frames: usize, fps: f64) -> PathBuf {
            let path = self.config.upload_dir.join(name);
            std::fs::write(&path, b"source").unwrap();
            codec.add_source(&path, frames, fps);
            path
        }
    }

    async fn wait_for(manager: &JobManager, id: &str, token: &str, status: JobStatus) -> JobResponse {
        for _ in 0..500 {
            let job = manager.query(id, Some(token)).unwrap();
            if job.status == status {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {} never reached {}", id, status);
    }

    fn options(multiplier: u32) -> JobOptions {
        JobOptions {
            multiplier: Some(multiplier),
            ..Default::default()
        }
    }

    fn write_y4m(path: &Path, frames: usize, fps: f64) {
        let info = StreamInfo { fps, width: 8, height: 8, frame_count: None };
        let mut writer = Y4mCodec.open_writer(path, &info, &CancelSignal::new()).unwrap();
        for i in 0..frames {
            writer.write_frame(&Frame::filled(8, 8, (i * 5) as u8)).unwrap();
        }
        writer.finish().unwrap();
    }

    #[tokio::test]
    async fn y4m_job_runs_end_to_end() {
        let codec = ContainerCodec::new(FfmpegCodec::new("definitely-not-ffmpeg", "definitely-not-ffprobe")).shared();
        let postprocess = PostProcessor::standard("definitely-not-ffmpeg", codec.clone());
        let h = harness_with(codec, blend_factory(), postprocess).await;

        let input = h.config.upload_dir.join("clip.y4m");
        write_y4m(&input, 10, 30.0);

        let opts = JobOptions {
            multiplier: Some(2),
            downscale: Some(0.5),
            ..Default::default()
        };
        let created = h.manager.submit("clip.y4m", opts).await.unwrap();
        assert_eq!(created.job.status, JobStatus::Queued);
        assert!(created.job.result_url.is_none());

        let done = wait_for(&h.manager, &created.job.id, &created.token, JobStatus::Completed).await;
        let metrics = done.metrics.unwrap();
        assert_eq!(metrics.frames, 28);
        assert_eq!(metrics.output_fps, 90.0);
        assert_eq!(metrics.input_fps, 30.0);
        assert_eq!(done.progress, 1.0);
        assert_eq!(done.stage, JobStage::Done);

        let url = done.result_url.unwrap();
        assert!(url.starts_with("http://localhost:3000/api/v1/jobs/"));
        assert!(url.contains(&format!("token={}", created.token)));

        assert!(!input.exists());
        let result = h.manager.fetch_result(&created.job.id, Some(&created.token)).await.unwrap();
        assert_eq!(result.file_name, format!("clip_{}_interp.y4m", created.job.id));
        let written = Y4mCodec.probe(&result.path).unwrap();
        assert_eq!(written.frame_count, Some(28));
        assert_eq!(written.fps, 90.0);
    }

    #[tokio::test]
    async fn preset_fields_are_overridden_by_explicit_ones() {
        let codec = MemoryCodec::new();
        let h = harness(&codec).await;
        h.add_input(&codec, "a.mp4", 2, 30.0);

        let opts = JobOptions {
            preset: Some("youtube_60fps".to_string()),
            multiplier: Some(3),
            ..Default::default()
        };
        let created = h.manager.submit("a.mp4", opts).await.unwrap();

        let params = created.job.params;
        assert_eq!(params.multiplier, 3);
        assert_eq!(params.target_fps, Some(60));
        assert_eq!(params.downscale, 1.0);
        assert_eq!(params.preset.as_deref(), Some("youtube_60fps"));
    }

    #[tokio::test]
    async fn invalid_combinations_are_rejected() {
        let codec = MemoryCodec::new();
        let h = harness(&codec).await;
        h.add_input(&codec, "fast.mp4", 2, 100.0);

        for opts in [
            options(5),
            JobOptions { downscale: Some(0.05), ..Default::default() },
            JobOptions { target_fps: Some(0), ..Default::default() },
            JobOptions { target_fps: Some(500), ..Default::default() },
            // 100 fps * (3 + 1) exceeds the 240 fps ceiling
            options(3),
        ] {
            let err = h.manager.submit("fast.mp4", opts).await.unwrap_err();
            assert!(matches!(err, AppError::InvalidCombination(_)), "{err:?}");
        }

        let opts = JobOptions {
            multiplier: Some(3),
            target_fps: Some(120),
            ..Default::default()
        };
        assert!(h.manager.submit("fast.mp4", opts).await.is_ok());
    }

    #[tokio::test]
    async fn bad_requests_are_rejected() {
        let codec = MemoryCodec::new();
        let h = harness(&codec).await;
        h.add_input(&codec, "a.mp4", 2, 30.0);

        let err = h
            .manager
            .submit("a.mp4", JobOptions { preset: Some("nope".into()), ..Default::default() })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        let err = h.manager.submit("../a.mp4", options(1)).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        let err = h.manager.submit("missing.mp4", options(1)).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn duplicate_explicit_id_conflicts() {
        let codec = MemoryCodec::new();
        let h = harness(&codec).await;
        h.add_input(&codec, "a.mp4", 2, 30.0);
        h.add_input(&codec, "b.mp4", 2, 30.0);

        let opts = JobOptions { id: Some("job-1".into()), ..Default::default() };
        let created = h.manager.submit("a.mp4", opts.clone()).await.unwrap();
        assert_eq!(created.job.id, "job-1");

        let err = h.manager.submit("b.mp4", opts).await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[tokio::test]
    async fn auth_is_checked_before_state() {
        let codec = MemoryCodec::new();
        let h = harness(&codec).await;
        h.add_input(&codec, "a.mp4", 2, 30.0);
        let created = h.manager.submit("a.mp4", options(1)).await.unwrap();
        let id = created.job.id.as_str();

        assert!(matches!(h.manager.query(id, Some("wrong-token")), Err(AppError::Forbidden)));
        assert!(matches!(h.manager.query(id, None), Err(AppError::Forbidden)));
        assert!(matches!(h.manager.cancel(id, Some("wrong-token")), Err(AppError::Forbidden)));
        assert!(matches!(
            h.manager.fetch_result(id, Some("wrong-token")).await,
            Err(AppError::Forbidden)
        ));
        assert!(matches!(
            h.manager.query("unknown", Some(&created.token)),
            Err(AppError::NotFound(_))
        ));

        let job = wait_for(&h.manager, id, &created.token, JobStatus::Completed).await;
        assert_eq!(job.metrics.unwrap().frames, 3);
    }

    #[tokio::test]
    async fn capacity_is_enforced_and_released_by_terminal_states() {
        let codec = MemoryCodec::new().with_frame_delay(Duration::from_millis(20));
        let h = harness(&codec).await;
        let limit = h.config.max_active_jobs;

        let mut created = Vec::new();
        for i in 0..=limit {
            h.add_input(&codec, &format!("in{i}.mp4"), 200, 30.0);
        }
        for i in 0..limit {
            created.push(h.manager.submit(&format!("in{i}.mp4"), options(1)).await.unwrap());
        }

        let err = h.manager.submit(&format!("in{limit}.mp4"), options(1)).await.unwrap_err();
        assert!(matches!(err, AppError::CapacityExceeded { .. }));

        h.manager.cancel(&created[0].job.id, Some(&created[0].token)).unwrap();
        let extra = h.manager.submit(&format!("in{limit}.mp4"), options(1)).await.unwrap();

        for job in created.iter().skip(1) {
            h.manager.cancel(&job.job.id, Some(&job.token)).unwrap();
        }
        h.manager.cancel(&extra.job.id, Some(&extra.token)).unwrap();
    }

    #[tokio::test]
    async fn cancel_mid_pipeline_removes_artifacts() {
        let codec = MemoryCodec::new().with_frame_delay(Duration::from_millis(10));
        let h = harness(&codec).await;
        let input = h.add_input(&codec, "long.mp4", 300, 30.0);

        let created = h.manager.submit("long.mp4", options(1)).await.unwrap();
        let (id, token) = (created.job.id.as_str(), created.token.as_str());
        wait_for(&h.manager, id, token, JobStatus::Processing).await;

        let first = h.manager.cancel(id, Some(token)).unwrap();
        let second = h.manager.cancel(id, Some(token)).unwrap();
        assert_eq!(first.status, JobStatus::Canceled);
        assert_eq!(second.status, JobStatus::Canceled);
        assert!(first.result_url.is_none());

        tokio::time::sleep(h.config.cancel_grace() + Duration::from_millis(200)).await;

        let output = h.manager.store().output_path_for(&input, id, None);
        assert!(!input.exists());
        assert!(!output.exists());
        assert_eq!(h.manager.query(id, Some(token)).unwrap().status, JobStatus::Canceled);
        assert!(matches!(h.manager.fetch_result(id, Some(token)).await, Err(AppError::NotReady)));
    }

    #[tokio::test]
    async fn queued_job_can_be_canceled_before_it_runs() {
        let codec = MemoryCodec::new().with_frame_delay(Duration::from_millis(20));
        let h = harness(&codec).await;

        let mut created = Vec::new();
        for i in 0..3 {
            h.add_input(&codec, &format!("q{i}.mp4"), 100, 30.0);
            created.push(h.manager.submit(&format!("q{i}.mp4"), options(1)).await.unwrap());
        }

        // two workers, so the third job is still waiting for a slot
        let last = &created[2];
        let canceled = h.manager.cancel(&last.job.id, Some(&last.token)).unwrap();
        assert_eq!(canceled.status, JobStatus::Canceled);
        assert_eq!(canceled.stage, JobStage::Canceled);

        for job in &created[..2] {
            h.manager.cancel(&job.job.id, Some(&job.token)).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(
            h.manager.query(&last.job.id, Some(&last.token)).unwrap().status,
            JobStatus::Canceled
        );
        assert!(!h.config.upload_dir.join("q2.mp4").exists());
    }

    #[tokio::test]
    async fn result_is_not_ready_while_processing() {
        let codec = MemoryCodec::new().with_frame_delay(Duration::from_millis(10));
        let h = harness(&codec).await;
        h.add_input(&codec, "slow.mp4", 200, 30.0);

        let created = h.manager.submit("slow.mp4", options(1)).await.unwrap();
        let err = h
            .manager
            .fetch_result(&created.job.id, Some(&created.token))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotReady));

        h.manager.cancel(&created.job.id, Some(&created.token)).unwrap();
    }

    #[tokio::test]
    async fn expired_jobs_are_gone_then_swept() {
        let codec = MemoryCodec::new();
        let h = harness(&codec).await;
        h.add_input(&codec, "short.mp4", 2, 30.0);

        let opts = JobOptions {
            ttl_seconds: Some(1),
            keep_audio: Some(false),
            ..Default::default()
        };
        let created = h.manager.submit("short.mp4", opts).await.unwrap();
        let (id, token) = (created.job.id.as_str(), created.token.as_str());
        wait_for(&h.manager, id, token, JobStatus::Completed).await;
        let result = h.manager.fetch_result(id, Some(token)).await.unwrap();
        assert!(result.path.exists());

        tokio::time::sleep(Duration::from_millis(1100)).await;

        assert!(matches!(h.manager.query(id, Some(token)), Err(AppError::NotFound(_))));
        assert!(matches!(h.manager.fetch_result(id, Some(token)).await, Err(AppError::Gone)));

        assert_eq!(h.manager.sweep_expired(), 1);
        assert!(!result.path.exists());
        assert!(!ArtifactStore::sidecar_path(&result.path).exists());
        assert!(matches!(
            h.manager.fetch_result(id, Some(token)).await,
            Err(AppError::NotFound(_))
        ));
        assert_eq!(h.manager.sweep_expired(), 0);
    }

    #[tokio::test]
    async fn reused_input_name_never_touches_an_unswept_result() {
        let codec = ContainerCodec::new(FfmpegCodec::new("definitely-not-ffmpeg", "definitely-not-ffprobe")).shared();
        let h = harness_with(codec, blend_factory(), PostProcessor::new(vec![], vec![])).await;
        let input = h.config.upload_dir.join("clip.y4m");

        write_y4m(&input, 10, 30.0);
        let opts = JobOptions {
            ttl_seconds: Some(1),
            ..options(1)
        };
        let first = h.manager.submit("clip.y4m", opts).await.unwrap();
        wait_for(&h.manager, &first.job.id, &first.token, JobStatus::Completed).await;
        let first_result = h.manager.fetch_result(&first.job.id, Some(&first.token)).await.unwrap();

        // same name again while the first record still owns it
        write_y4m(&input, 3, 30.0);
        let err = h.manager.submit("clip.y4m", options(1)).await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
        assert_eq!(Y4mCodec.probe(&first_result.path).unwrap().frame_count, Some(19));

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(h.manager.sweep_expired(), 1);
        assert!(!first_result.path.exists());

        write_y4m(&input, 3, 30.0);
        let second = h.manager.submit("clip.y4m", options(1)).await.unwrap();
        wait_for(&h.manager, &second.job.id, &second.token, JobStatus::Completed).await;
        let second_result = h.manager.fetch_result(&second.job.id, Some(&second.token)).await.unwrap();

        assert_ne!(second_result.path, first_result.path);
        assert_eq!(Y4mCodec.probe(&second_result.path).unwrap().frame_count, Some(5));
        assert_eq!(h.manager.sweep_expired(), 0);
        assert!(second_result.path.exists());
    }

    #[tokio::test]
    async fn sweep_terminates_expired_running_and_queued_jobs() {
        let codec = MemoryCodec::new().with_frame_delay(Duration::from_millis(10));
        let h = harness(&codec).await;

        let short = JobOptions {
            ttl_seconds: Some(1),
            ..options(1)
        };
        let mut created = Vec::new();
        for i in 0..3 {
            h.add_input(&codec, &format!("s{i}.mp4"), 400, 30.0);
            created.push(h.manager.submit(&format!("s{i}.mp4"), short.clone()).await.unwrap());
        }
        let running = &created[0];
        wait_for(&h.manager, &running.job.id, &running.token, JobStatus::Processing).await;
        // two workers, so the third job is still queued
        let queued = &created[2];
        assert_eq!(
            h.manager.query(&queued.job.id, Some(&queued.token)).unwrap().status,
            JobStatus::Queued
        );

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(h.manager.sweep_expired(), 3);

        tokio::time::sleep(Duration::from_millis(300)).await;
        for (i, job) in created.iter().enumerate() {
            let input = h.config.upload_dir.join(format!("s{i}.mp4"));
            assert!(!input.exists());
            assert!(!h.manager.store().output_path_for(&input, &job.job.id, None).exists());
            assert!(matches!(h.manager.query(&job.job.id, Some(&job.token)), Err(AppError::NotFound(_))));
        }
        assert_eq!(h.manager.health().active_jobs, 0);
        assert_eq!(h.manager.health().idle_workers, h.config.max_workers);
    }

    #[tokio::test]
    async fn background_sweeper_purges_expired_results() {
        let codec = MemoryCodec::new();
        let h = harness(&codec).await;
        h.add_input(&codec, "short.mp4", 2, 30.0);

        let shutdown = CancellationToken::new();
        let sweeper = start_sweeper(h.manager.clone(), Duration::from_millis(100), shutdown.clone());

        let opts = JobOptions {
            ttl_seconds: Some(1),
            ..options(1)
        };
        let created = h.manager.submit("short.mp4", opts).await.unwrap();
        let (id, token) = (created.job.id.as_str(), created.token.as_str());
        wait_for(&h.manager, id, token, JobStatus::Completed).await;
        let result = h.manager.fetch_result(id, Some(token)).await.unwrap();

        let mut purged = false;
        for _ in 0..30 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if !result.path.exists() {
                purged = true;
                break;
            }
        }
        assert!(purged, "sweeper never removed the expired result");
        assert!(matches!(h.manager.fetch_result(id, Some(token)).await, Err(AppError::NotFound(_))));

        shutdown.cancel();
        sweeper.await.unwrap();
    }

    struct FailingInterpolator;

    impl FrameInterpolator for FailingInterpolator {
        fn interpolate(&self, _a: &Frame, _b: &Frame, _t: f32) -> MediaResult<Frame> {
            Err(MediaError::UnsupportedFormat("engine offline".to_string()))
        }
    }

    struct PanickingInterpolator;

    impl FrameInterpolator for PanickingInterpolator {
        fn interpolate(&self, _a: &Frame, _b: &Frame, _t: f32) -> MediaResult<Frame> {
            panic!("engine bug");
        }
    }

    #[tokio::test]
    async fn engine_failure_marks_job_failed_and_cleans_up() {
        let codec = MemoryCodec::new();
        let factory: InterpolatorFactory = Arc::new(|_: f32| Arc::new(FailingInterpolator) as Arc<dyn FrameInterpolator>);
        let h = harness_with(Arc::new(codec.clone()), factory, PostProcessor::new(vec![], vec![])).await;
        let input = h.add_input(&codec, "a.mp4", 5, 30.0);

        let created = h.manager.submit("a.mp4", options(1)).await.unwrap();
        let failed = wait_for(&h.manager, &created.job.id, &created.token, JobStatus::Failed).await;

        assert!(failed.message.unwrap().contains("engine offline"));
        assert_eq!(failed.stage, JobStage::Failed);
        assert!(!input.exists());
        assert!(!h.manager.store().output_path_for(&input, &created.job.id, None).exists());
        assert!(matches!(
            h.manager.fetch_result(&created.job.id, Some(&created.token)).await,
            Err(AppError::NotReady)
        ));
    }

    #[tokio::test]
    async fn panicking_engine_fails_only_its_job() {
        let codec = MemoryCodec::new();
        let factory: InterpolatorFactory = Arc::new(|downscale: f32| {
            if downscale < 1.0 {
                Arc::new(PanickingInterpolator) as Arc<dyn FrameInterpolator>
            } else {
                Arc::new(BlendInterpolator::new(downscale)) as Arc<dyn FrameInterpolator>
            }
        });
        let h = harness_with(Arc::new(codec.clone()), factory, PostProcessor::new(vec![], vec![])).await;
        h.add_input(&codec, "bad.mp4", 3, 30.0);
        h.add_input(&codec, "good.mp4", 3, 30.0);

        let bad = h
            .manager
            .submit("bad.mp4", JobOptions { downscale: Some(0.5), ..Default::default() })
            .await
            .unwrap();
        wait_for(&h.manager, &bad.job.id, &bad.token, JobStatus::Failed).await;

        let good = h.manager.submit("good.mp4", options(1)).await.unwrap();
        wait_for(&h.manager, &good.job.id, &good.token, JobStatus::Completed).await;
    }
}
