use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use crate::config::env::{self, EnvKey};

const DEFAULT_TTL_SECONDS: u64 = 24 * 60 * 60;
const DEFAULT_MAX_UPLOAD_BYTES: usize = 1024 * 1024 * 1024;

#[derive(Clone, Debug, Deserialize)]
pub struct AppConfig {
    pub server_port: u16,
    pub upload_dir: PathBuf,
    pub output_dir: PathBuf,
    pub job_ttl_seconds: u64,
    pub max_workers: usize,
    pub max_active_jobs: usize,
    pub sweep_interval_seconds: u64,
    pub pipeline_queue_capacity: usize,
    pub max_output_fps: u32,
    pub cancel_grace_ms: u64,
    pub public_base_url: String,
    pub max_upload_bytes: usize,
    pub ffmpeg_bin: String,
    pub ffprobe_bin: String,
}

impl AppConfig {
    pub fn new() -> Result<Self, std::env::VarError> {
        let server_port = env::get_parsed(EnvKey::ServerPort, 3000);
        Ok(Self {
            server_port,
            upload_dir: PathBuf::from(env::get_or(EnvKey::UploadDir, "var/uploads")),
            output_dir: PathBuf::from(env::get_or(EnvKey::OutputDir, "var/outputs")),
            job_ttl_seconds: env::get_parsed(EnvKey::JobTtlSeconds, DEFAULT_TTL_SECONDS),
            max_workers: env::get_parsed(EnvKey::MaxWorkers, 2usize).max(1),
            max_active_jobs: env::get_parsed(EnvKey::MaxActiveJobs, 16usize).max(1),
            sweep_interval_seconds: env::get_parsed(EnvKey::SweepIntervalSeconds, 30u64).max(1),
            pipeline_queue_capacity: env::get_parsed(EnvKey::PipelineQueueCapacity, 100usize).max(1),
            max_output_fps: env::get_parsed(EnvKey::MaxOutputFps, 240),
            cancel_grace_ms: env::get_parsed(EnvKey::CancelGraceMs, 2000),
            public_base_url: env::get_or(
                EnvKey::PublicBaseUrl,
                &format!("http://localhost:{}", server_port),
            ),
            max_upload_bytes: env::get_parsed(EnvKey::MaxUploadBytes, DEFAULT_MAX_UPLOAD_BYTES),
            ffmpeg_bin: env::get_or(EnvKey::FfmpegBin, "ffmpeg"),
            ffprobe_bin: env::get_or(EnvKey::FfprobeBin, "ffprobe"),
        })
    }

    pub fn job_ttl(&self) -> Duration {
        Duration::from_secs(self.job_ttl_seconds)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }

    /// Config rooted in a scratch directory, used by tests.
    #[cfg(test)]
    pub fn for_tests(root: &std::path::Path) -> Self {
        Self {
            server_port: 0,
            upload_dir: root.join("uploads"),
            output_dir: root.join("outputs"),
            job_ttl_seconds: DEFAULT_TTL_SECONDS,
            max_workers: 2,
            max_active_jobs: 4,
            sweep_interval_seconds: 30,
            pipeline_queue_capacity: 4,
            max_output_fps: 240,
            cancel_grace_ms: 50,
            public_base_url: "http://localhost:3000".to_string(),
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            ffmpeg_bin: "ffmpeg".to_string(),
            ffprobe_bin: "ffprobe".to_string(),
        }
    }
}
