//! Read-path request handlers.

use super::error::ApiError;
use super::AppState;
use crate::domain::hls::{PLAYLIST_MIME, SEGMENT_MIME};
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
pub struct MasterQuery {
    pub bandwidth: Option<u64>,
    pub bitrate: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PreloadBody {
    pub bitrate: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct AnalyticsQuery {
    #[serde(rename = "chapterId")]
    pub chapter_id: Option<String>,
}

fn playlist_headers(max_age: &'static str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(PLAYLIST_MIME));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static(max_age));
    headers
}

fn parse_bitrate(raw: &str) -> Result<u32, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::BadRequest(format!("bitrate must be a number, got {:?}", raw)))
}

pub async fn master_playlist(
    State(state): State<Arc<AppState>>,
    Path(chapter_id): Path<String>,
    Query(query): Query<MasterQuery>,
) -> Result<Response, ApiError> {
    let body = state
        .streaming
        .master_playlist(&chapter_id, query.bandwidth, query.bitrate)
        .await?;
    Ok((playlist_headers("public, max-age=300"), body).into_response())
}

pub async fn variant_playlist(
    State(state): State<Arc<AppState>>,
    Path((chapter_id, bitrate)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let bitrate = parse_bitrate(&bitrate)?;
    let body = state
        .streaming
        .variant_playlist(&chapter_id, bitrate)
        .await?;
    Ok((playlist_headers("public, max-age=60"), body).into_response())
}

pub async fn segment(
    State(state): State<Arc<AppState>>,
    Path((chapter_id, bitrate, segment_id)): Path<(String, String, String)>,
) -> Result<Response, ApiError> {
    let bitrate = parse_bitrate(&bitrate)?;
    let data = state
        .streaming
        .segment(&chapter_id, bitrate, &segment_id)
        .await?;

    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(SEGMENT_MIME));
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("public, max-age=3600"),
    );
    Ok((headers, data).into_response())
}

pub async fn streaming_status(
    State(state): State<Arc<AppState>>,
    Path(chapter_id): Path<String>,
) -> Result<Response, ApiError> {
    let status = state.streaming.status(&chapter_id).await?;
    Ok(Json(status).into_response())
}

pub async fn preload(
    State(state): State<Arc<AppState>>,
    Path(chapter_id): Path<String>,
    body: Option<Json<PreloadBody>>,
) -> Result<Response, ApiError> {
    let bitrate = body.and_then(|Json(body)| body.bitrate);
    let loaded = state.streaming.preload(&chapter_id, bitrate).await?;
    Ok(Json(json!({
        "chapter_id": chapter_id,
        "bitrate": bitrate.unwrap_or(128),
        "status": "preloaded",
        "segments_loaded": loaded,
    }))
    .into_response())
}

pub async fn analytics(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AnalyticsQuery>,
) -> Response {
    Json(state.streaming.analytics(query.chapter_id)).into_response()
}

#[derive(Debug, Serialize)]
struct HealthReport {
    status: &'static str,
    components: serde_json::Value,
}

/// Component map. Database and storage gate the overall status; the broker
/// and cache are reported but advisory, since reads fall through to storage.
pub async fn health(State(state): State<Arc<AppState>>) -> Response {
    let database = crate::adapters::db::ping(&state.db).await.is_ok();
    let redis = state.redis.ping().await.is_ok();
    let storage = state.storage.test().await.is_ok();

    let healthy = database && storage;
    let report = HealthReport {
        status: if healthy { "ok" } else { "degraded" },
        components: json!({
            "database": up(database),
            "cache": up(redis),
            "queue": up(redis),
            "storage": up(storage),
        }),
    };
    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(report)).into_response()
}

fn up(ok: bool) -> &'static str {
    if ok {
        "up"
    } else {
        "down"
    }
}
