use std::env;
use std::str::FromStr;

pub enum EnvKey {
    ServerPort,
    UploadDir,
    OutputDir,
    JobTtlSeconds,
    MaxWorkers,
    MaxActiveJobs,
    SweepIntervalSeconds,
    PipelineQueueCapacity,
    MaxOutputFps,
    CancelGraceMs,
    PublicBaseUrl,
    MaxUploadBytes,
    FfmpegBin,
    FfprobeBin,
}

impl EnvKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvKey::ServerPort => "APP_PORT",
            EnvKey::UploadDir => "UPLOAD_DIR",
            EnvKey::OutputDir => "OUTPUT_DIR",
            EnvKey::JobTtlSeconds => "JOB_TTL_SECONDS",
            EnvKey::MaxWorkers => "MAX_WORKERS",
            EnvKey::MaxActiveJobs => "MAX_ACTIVE_JOBS",
            EnvKey::SweepIntervalSeconds => "SWEEP_INTERVAL_SECONDS",
            EnvKey::PipelineQueueCapacity => "PIPELINE_QUEUE_CAPACITY",
            EnvKey::MaxOutputFps => "MAX_OUTPUT_FPS",
            EnvKey::CancelGraceMs => "CANCEL_GRACE_MS",
            EnvKey::PublicBaseUrl => "PUBLIC_BASE_URL",
            EnvKey::MaxUploadBytes => "MAX_UPLOAD_BYTES",
            EnvKey::FfmpegBin => "FFMPEG_BIN",
            EnvKey::FfprobeBin => "FFPROBE_BIN",
        }
    }
}

pub fn get(key: EnvKey) -> Result<String, env::VarError> {
    env::var(key.as_str())
}

pub fn get_or(key: EnvKey, default: &str) -> String {
    env::var(key.as_str()).unwrap_or_else(|_| default.to_string())
}

pub fn get_parsed<T: FromStr>(key: EnvKey, default: T) -> T {
    match get(key) {
        Ok(val) => val.parse::<T>().unwrap_or(default),
        Err(_) => default,
    }
}
