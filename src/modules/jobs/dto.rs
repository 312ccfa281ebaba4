use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use utoipa::{IntoParams, ToSchema};
use validator::{Validate, ValidationError};

use super::model::{JobMetrics, JobParams, JobStage, JobStatus};

fn validate_identifier(value: &str) -> Result<(), ValidationError> {
    if value.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
        Ok(())
    } else {
        Err(ValidationError::new("identifier")
            .with_message("only letters, digits, '-' and '_' are allowed".into()))
    }
}

/// Processing options shared by the JSON and multipart submissions.
/// Explicit fields override the preset's.
#[derive(Debug, Default, Clone, Deserialize, Validate, ToSchema)]
pub struct JobOptions {
    #[validate(length(min = 1, max = 64), custom(function = "validate_identifier"))]
    pub id: Option<String>,
    #[validate(length(min = 8, max = 128), custom(function = "validate_identifier"))]
    pub token: Option<String>,
    #[validate(range(min = 1, max = 2592000, message = "ttl_seconds must be between 1 and 30 days"))]
    pub ttl_seconds: Option<u64>,
    pub preset: Option<String>,
    /// Frames to synthesize between each source pair (1 to 4).
    pub multiplier: Option<u32>,
    pub target_fps: Option<u32>,
    /// Motion analysis scale (0.1 to 1.0).
    pub downscale: Option<f32>,
    pub keep_audio: Option<bool>,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct CreateJobRequest {
    /// File already present in the upload directory.
    #[validate(length(min = 1, message = "input_filename is required"))]
    pub input_filename: String,
    #[serde(flatten)]
    #[validate(nested)]
    pub options: JobOptions,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct JobResponse {
    pub id: String,
    pub status: JobStatus,
    pub stage: JobStage,
    pub progress: f32,
    pub message: Option<String>,
    pub params: JobParams,
    pub metrics: Option<JobMetrics>,
    pub result_url: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    #[schema(value_type = String, format = DateTime)]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    #[schema(value_type = String, format = DateTime)]
    pub updated_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    #[schema(value_type = String, format = DateTime)]
    pub expires_at: OffsetDateTime,
}

/// Submission result. The token is only ever returned here.
#[derive(Debug, Serialize, ToSchema)]
pub struct JobCreatedResponse {
    pub token: String,
    #[serde(flatten)]
    pub job: JobResponse,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub active_jobs: usize,
    pub workers: usize,
    pub idle_workers: usize,
}

#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct TokenQuery {
    /// Job token; the `X-Job-Token` header is accepted as well.
    pub token: Option<String>,
}

#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct ResultQuery {
    pub token: Option<String>,
    /// `1` to force an attachment download.
    pub download: Option<String>,
}

impl ResultQuery {
    pub fn wants_download(&self) -> bool {
        matches!(self.download.as_deref(), Some("1" | "true" | "yes"))
    }
}
