use utoipa::OpenApi;
use crate::common::response::ErrorBody;
use crate::modules::jobs::dto::*;
use crate::modules::jobs::model::{JobMetrics, JobParams, JobStage, JobStatus, Preset};

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::modules::jobs::handler::health,
        crate::modules::jobs::handler::list_presets,
        crate::modules::jobs::handler::create_job,
        crate::modules::jobs::handler::upload_job,
        crate::modules::jobs::handler::get_job,
        crate::modules::jobs::handler::cancel_job,
        crate::modules::jobs::handler::get_result,
    ),
    components(
        schemas(
            CreateJobRequest, JobOptions, HealthResponse, JobResponse, JobCreatedResponse,
            JobParams, JobMetrics, JobStatus, JobStage, Preset,
            ErrorBody,
        )
    ),
    tags(
        (name = "System", description = "Liveness"),
        (name = "Jobs", description = "Frame interpolation jobs")
    ),
    modifiers(&JobTokenAddon)
)]
pub struct ApiDoc;

use utoipa::Modify;
use utoipa::openapi::security::{ApiKey, ApiKeyValue, SecurityScheme};

/// Documents the per-job token header.
pub struct JobTokenAddon;

impl Modify for JobTokenAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "job_token",
                SecurityScheme::ApiKey(ApiKey::Header(ApiKeyValue::new("X-Job-Token"))),
            );
        }
    }
}
