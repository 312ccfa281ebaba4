use axum::routing::{get, post};
use axum::Router;
use crate::state::AppState;

pub mod dto;
pub mod handler;
pub mod model;
pub mod repository;
pub mod service;
pub mod stream_handler;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/presets", get(handler::list_presets))
        .route("/jobs", post(handler::create_job))
        .route("/jobs/upload", post(handler::upload_job))
        .route("/jobs/{id}", get(handler::get_job))
        .route("/jobs/{id}/cancel", post(handler::cancel_job))
        .route("/jobs/{id}/result", get(handler::get_result))
}
