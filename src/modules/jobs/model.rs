use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use subtle::ConstantTimeEq;
use time::OffsetDateTime;
use utoipa::ToSchema;

use crate::common::cancel::CancelSignal;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Canceled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Canceled)
    }

    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Queued, Processing)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Queued, Canceled)
                | (Processing, Canceled)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Canceled => "canceled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Finer-grained label of what a job is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum JobStage {
    Queued,
    Starting,
    Interpolating,
    Finalizing,
    Done,
    Failed,
    Canceled,
}

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct JobParams {
    /// Frames synthesized between each pair of source frames.
    pub multiplier: u32,
    pub target_fps: Option<u32>,
    pub downscale: f32,
    pub keep_audio: bool,
    pub preset: Option<String>,
}

impl Default for JobParams {
    fn default() -> Self {
        Self {
            multiplier: 1,
            target_fps: None,
            downscale: 1.0,
            keep_audio: true,
            preset: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, ToSchema)]
pub struct JobMetrics {
    /// Pipeline throughput in frames per second.
    pub avg_fps: f64,
    pub frames: u64,
    pub input_fps: f64,
    pub output_fps: f64,
    pub width: u32,
    pub height: u32,
}

#[derive(Clone)]
pub struct Job {
    pub id: String,
    pub token: String,
    pub status: JobStatus,
    pub stage: JobStage,
    pub progress: f32,
    pub message: Option<String>,
    pub params: JobParams,
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    pub output_deleted: bool,
    pub metrics: Option<JobMetrics>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    pub expires_at: OffsetDateTime,
    pub cancel: CancelSignal,
}

impl Job {
    pub fn new(
        id: String,
        token: String,
        params: JobParams,
        input_path: PathBuf,
        output_path: PathBuf,
        ttl: Duration,
    ) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            id,
            token,
            status: JobStatus::Queued,
            stage: JobStage::Queued,
            progress: 0.0,
            message: None,
            params,
            input_path,
            output_path,
            output_deleted: false,
            metrics: None,
            created_at: now,
            updated_at: now,
            expires_at: now + ttl,
            cancel: CancelSignal::new(),
        }
    }

    /// Applies a status change if the state machine allows it.
    pub fn transition(&mut self, next: JobStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        self.touch();
        true
    }

    pub fn set_progress(&mut self, stage: JobStage, progress: f32) {
        self.stage = stage;
        self.progress = progress.clamp(0.0, 1.0);
        self.touch();
    }

    pub fn touch(&mut self) {
        self.updated_at = OffsetDateTime::now_utc();
    }

    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        now >= self.expires_at
    }

    /// Constant-time comparison against the job's capability token.
    pub fn token_matches(&self, candidate: Option<&str>) -> bool {
        let Some(candidate) = candidate else {
            return false;
        };
        candidate.as_bytes().ct_eq(self.token.as_bytes()).into()
    }

    pub fn has_result(&self) -> bool {
        self.status == JobStatus::Completed && !self.output_deleted
    }
}

/// Named parameter bundle a submission can start from.
#[derive(Debug, Clone, Copy, Serialize, ToSchema)]
pub struct Preset {
    #[schema(value_type = String)]
    pub name: &'static str,
    #[schema(value_type = String)]
    pub description: &'static str,
    pub multiplier: u32,
    pub target_fps: Option<u32>,
    pub downscale: f32,
}

pub const PRESETS: &[Preset] = &[
    Preset {
        name: "youtube_60fps",
        description: "Smooth 60 fps for video platforms",
        multiplier: 2,
        target_fps: Some(60),
        downscale: 1.0,
    },
    Preset {
        name: "stories_30fps",
        description: "Light 30 fps output for short vertical clips",
        multiplier: 2,
        target_fps: Some(30),
        downscale: 0.75,
    },
    Preset {
        name: "quality_120fps",
        description: "High frame rate at full analysis resolution",
        multiplier: 4,
        target_fps: Some(120),
        downscale: 1.0,
    },
    Preset {
        name: "mobile_light",
        description: "48 fps with coarse motion analysis for fast turnaround",
        multiplier: 2,
        target_fps: Some(48),
        downscale: 0.5,
    },
];

pub fn find_preset(name: &str) -> Option<&'static Preset> {
    PRESETS.iter().find(|p| p.name == name)
}
