//! Error-to-status mapping at the handler boundary.

use crate::error::Error;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::error;

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unauthorized,
    NotFound(String),
    Internal,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                String::from("user_id header is required"),
            ),
            ApiError::NotFound(message) => (StatusCode::NOT_FOUND, message),
            ApiError::Internal => (
                StatusCode::INTERNAL_SERVER_ERROR,
                String::from("internal server error"),
            ),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        match err {
            Error::NoRenditions(chapter_id) => ApiError::NotFound(format!(
                "no renditions available for chapter {}",
                chapter_id
            )),
            Error::RenditionUnavailable {
                chapter_id,
                bitrate,
            } => ApiError::NotFound(format!(
                "rendition {}k for chapter {} is not available",
                bitrate, chapter_id
            )),
            Error::SegmentNotFound(segment) => {
                ApiError::NotFound(format!("segment {} not found", segment))
            }
            // Storage keys and connection strings stay out of responses.
            err => {
                error!(%err, "request failed");
                ApiError::Internal
            }
        }
    }
}
