use crate::common::error::{AppError, AppResult};
use crate::common::response::{ApiResponse, ApiSuccess, ErrorBody};
use crate::common::upload::stream_to_file;
use crate::infrastructure::storage::artifacts::ArtifactStore;
use crate::modules::jobs::dto::*;
use crate::modules::jobs::model::Preset;
use crate::modules::jobs::stream_handler::serve_file;
use crate::state::AppState;
use axum::{
    extract::{rejection::JsonRejection, Multipart, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use std::str::FromStr;
use tracing::{debug, info};
use uuid::Uuid;
use validator::Validate;

pub const JOB_TOKEN_HEADER: &str = "x-job-token";

/// `?token=` wins over the `X-Job-Token` header.
fn job_token(query: Option<String>, headers: &HeaderMap) -> Option<String> {
    query.or_else(|| {
        headers
            .get(JOB_TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    })
}

#[utoipa::path(
    get,
    path = "/api/v1/health",
    responses(
        (status = 200, description = "Service is alive", body = ApiResponse<HealthResponse>)
    ),
    tag = "System"
)]
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    ApiSuccess(ApiResponse::success(state.jobs.health(), "Service healthy"), StatusCode::OK).into_response()
}

#[utoipa::path(
    get,
    path = "/api/v1/presets",
    responses(
        (status = 200, description = "Available presets", body = ApiResponse<Vec<Preset>>)
    ),
    tag = "Jobs"
)]
pub async fn list_presets(State(state): State<AppState>) -> impl IntoResponse {
    ApiSuccess(
        ApiResponse::success(state.jobs.list_presets(), "Presets retrieved successfully"),
        StatusCode::OK,
    )
    .into_response()
}

/// Submit a job for a file already present in the upload directory
#[utoipa::path(
    post,
    path = "/api/v1/jobs",
    request_body = CreateJobRequest,
    responses(
        (status = 202, description = "Job queued", body = ApiResponse<JobCreatedResponse>),
        (status = 400, description = "Bad Request", body = ErrorBody),
        (status = 404, description = "Input file not found", body = ErrorBody),
        (status = 409, description = "Job id or input already in use", body = ErrorBody),
        (status = 422, description = "Invalid parameter combination", body = ErrorBody),
        (status = 429, description = "Too many active jobs", body = ErrorBody)
    ),
    tag = "Jobs"
)]
pub async fn create_job(
    State(state): State<AppState>,
    payload: Result<Json<CreateJobRequest>, JsonRejection>,
) -> impl IntoResponse {
    let req = match payload {
        Ok(Json(req)) => req,
        Err(e) => return AppError::validation(e.body_text()).into_response(),
    };
    if let Err(e) = req.validate() {
        return AppError::from(e).into_response();
    }

    match state.jobs.submit(&req.input_filename, req.options).await {
        Ok(res) => ApiSuccess(ApiResponse::success(res, "Job queued"), StatusCode::ACCEPTED).into_response(),
        Err(e) => e.into_response(),
    }
}

/// Upload a video and submit it in one request
/// Multipart form: a `video` file plus optional option fields (`preset`, `multiplier`, ...)
#[utoipa::path(
    post,
    path = "/api/v1/jobs/upload",
    request_body(content = String, content_type = "multipart/form-data"),
    responses(
        (status = 202, description = "Job queued", body = ApiResponse<JobCreatedResponse>),
        (status = 400, description = "Bad Request", body = ErrorBody),
        (status = 413, description = "Upload too large"),
        (status = 422, description = "Invalid parameter combination", body = ErrorBody),
        (status = 429, description = "Too many active jobs", body = ErrorBody)
    ),
    tag = "Jobs"
)]
pub async fn upload_job(State(state): State<AppState>, multipart: Multipart) -> impl IntoResponse {
    match submit_upload(&state, multipart).await {
        Ok(res) => ApiSuccess(ApiResponse::success(res, "Job queued"), StatusCode::ACCEPTED).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn submit_upload(state: &AppState, mut multipart: Multipart) -> AppResult<JobCreatedResponse> {
    let mut options = JobOptions::default();
    let mut stored: Option<String> = None;

    let read = read_form(state, &mut multipart, &mut options, &mut stored).await;
    let result = match (read, stored.as_deref()) {
        (Ok(()), Some(name)) => state.jobs.submit(name, options).await,
        (Ok(()), None) => Err(AppError::validation("No video field found in multipart request")),
        (Err(e), _) => Err(e),
    };

    // the upload belongs to nobody unless the job was admitted
    if result.is_err() {
        if let Some(path) = stored.and_then(|name| state.jobs.store().input_path(&name).ok()) {
            ArtifactStore::delete(&path);
        }
    }
    result
}

async fn read_form(
    state: &AppState,
    multipart: &mut Multipart,
    options: &mut JobOptions,
    stored: &mut Option<String>,
) -> AppResult<()> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::validation(format!("Malformed multipart body: {}", e)))?
    {
        let name = field.name().unwrap_or("").to_string();

        if name == "video" {
            if stored.is_some() {
                return Err(AppError::validation("Only one video field is allowed"));
            }
            let original = field.file_name().unwrap_or("video.mp4").to_string();
            let safe = ArtifactStore::sanitize_file_name(&original)?;
            let unique = format!("{}_{}", &Uuid::new_v4().simple().to_string()[..8], safe);
            let dest = state.jobs.store().input_path(&unique)?;

            info!(file = %original, stored = %unique, "🎥 Receiving upload");
            stream_to_file(field, &dest, state.config.max_upload_bytes)
                .await
                .map_err(|e| AppError::validation(format!("Upload failed: {}", e)))?;
            *stored = Some(unique);
        } else {
            let value = field
                .text()
                .await
                .map_err(|e| AppError::validation(format!("Malformed field '{}': {}", name, e)))?;
            apply_form_field(options, &name, &value)?;
        }
    }
    Ok(())
}

fn parse_field<T: FromStr>(name: &str, value: &str) -> AppResult<T> {
    value
        .parse()
        .map_err(|_| AppError::validation(format!("invalid value for '{}'", name)))
}

fn parse_flag(name: &str, value: &str) -> AppResult<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(AppError::validation(format!("invalid value for '{}'", name))),
    }
}

/// Maps one text form field onto the submission options. Blank values count as absent.
fn apply_form_field(options: &mut JobOptions, name: &str, value: &str) -> AppResult<()> {
    let value = value.trim();
    if value.is_empty() {
        return Ok(());
    }

    match name {
        "id" => options.id = Some(value.to_string()),
        "token" => options.token = Some(value.to_string()),
        "ttl_seconds" => options.ttl_seconds = Some(parse_field(name, value)?),
        "preset" => options.preset = Some(value.to_string()),
        "multiplier" => options.multiplier = Some(parse_field(name, value)?),
        "target_fps" => options.target_fps = Some(parse_field(name, value)?),
        "downscale" => options.downscale = Some(parse_field(name, value)?),
        "keep_audio" => options.keep_audio = Some(parse_flag(name, value)?),
        other => debug!(field = other, "Ignoring unknown form field"),
    }
    Ok(())
}

#[utoipa::path(
    get,
    path = "/api/v1/jobs/{id}",
    params(
        ("id" = String, Path, description = "Job ID"),
        TokenQuery
    ),
    responses(
        (status = 200, description = "Job status", body = ApiResponse<JobResponse>),
        (status = 403, description = "Invalid token", body = ErrorBody),
        (status = 404, description = "Job not found", body = ErrorBody)
    ),
    tag = "Jobs"
)]
pub async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<TokenQuery>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let token = job_token(q.token, &headers);
    match state.jobs.query(&id, token.as_deref()) {
        Ok(res) => ApiSuccess(ApiResponse::success(res, "Job retrieved successfully"), StatusCode::OK).into_response(),
        Err(e) => e.into_response(),
    }
}

#[utoipa::path(
    post,
    path = "/api/v1/jobs/{id}/cancel",
    params(
        ("id" = String, Path, description = "Job ID"),
        TokenQuery
    ),
    responses(
        (status = 200, description = "Job canceled, or already terminal", body = ApiResponse<JobResponse>),
        (status = 403, description = "Invalid token", body = ErrorBody),
        (status = 404, description = "Job not found", body = ErrorBody)
    ),
    tag = "Jobs"
)]
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<TokenQuery>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let token = job_token(q.token, &headers);
    match state.jobs.cancel(&id, token.as_deref()) {
        Ok(res) => ApiSuccess(ApiResponse::success(res, "Job canceled"), StatusCode::OK).into_response(),
        Err(e) => e.into_response(),
    }
}

/// Stream the interpolated video
/// Supports `Range` requests; `download=1` serves it as an attachment
#[utoipa::path(
    get,
    path = "/api/v1/jobs/{id}/result",
    params(
        ("id" = String, Path, description = "Job ID"),
        ResultQuery
    ),
    responses(
        (status = 200, description = "Full result"),
        (status = 206, description = "Partial Content"),
        (status = 403, description = "Invalid token", body = ErrorBody),
        (status = 404, description = "Not found or not ready", body = ErrorBody),
        (status = 410, description = "Result expired", body = ErrorBody),
        (status = 416, description = "Range not satisfiable")
    ),
    tag = "Jobs"
)]
pub async fn get_result(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<ResultQuery>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let download = q.wants_download();
    let token = job_token(q.token, &headers);

    match state.jobs.fetch_result(&id, token.as_deref()).await {
        Ok(result) => {
            serve_file(
                &result.path,
                result.size,
                &headers,
                &result.content_type,
                &result.file_name,
                download,
            )
            .await
        }
        Err(e) => e.into_response(),
    }
}
