//! Router configuration.

use super::error::ApiError;
use super::handlers;
use super::AppState;
use axum::extract::Request;
use axum::http::{header, HeaderName, HeaderValue, Method};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

/// The caller is an upstream trusted service; it must identify the end user.
async fn require_user_id(request: Request, next: Next) -> Result<Response, ApiError> {
    let valid = request
        .headers()
        .get("user_id")
        .and_then(|value| value.to_str().ok())
        .map(|value| !value.trim().is_empty())
        .unwrap_or(false);
    if !valid {
        return Err(ApiError::Unauthorized);
    }
    Ok(next.run(request).await)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let allow_origin = if origins.is_empty() {
        AllowOrigin::any()
    } else {
        AllowOrigin::list(
            origins
                .iter()
                .filter_map(|origin| HeaderValue::from_str(origin).ok()),
        )
    };
    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS, Method::HEAD])
        .allow_headers([
            header::ACCEPT,
            header::CONTENT_TYPE,
            header::ORIGIN,
            header::RANGE,
            HeaderName::from_static("user_id"),
        ])
        .expose_headers([
            header::CONTENT_RANGE,
            header::CONTENT_LENGTH,
            header::ACCEPT_RANGES,
        ])
}

/// Build the `/api/v1/stream` router. Health is mounted after the auth
/// layer so probes need no credentials.
pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = cors_layer(&state.cors_origins);

    let stream = Router::new()
        .route(
            "/chapters/{chapter_id}/master.m3u8",
            get(handlers::master_playlist),
        )
        .route(
            "/chapters/{chapter_id}/{bitrate}/playlist.m3u8",
            get(handlers::variant_playlist),
        )
        .route(
            "/chapters/{chapter_id}/{bitrate}/segments/{segment_id}",
            get(handlers::segment),
        )
        .route(
            "/chapters/{chapter_id}/status",
            get(handlers::streaming_status),
        )
        .route("/chapters/{chapter_id}/preload", post(handlers::preload))
        .route("/analytics", get(handlers::analytics))
        .layer(middleware::from_fn(require_user_id))
        .route("/health", get(handlers::health));

    Router::new()
        .nest("/api/v1/stream", stream)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::db;
    use crate::adapters::redis::{RedisPool, RedisStreamCache};
    use crate::adapters::storage::LocalStorage;
    use crate::application::streaming::{StreamingOptions, StreamingService};
    use crate::domain::model::Rendition;
    use crate::ports::repository::RenditionRepository;
    use axum::body::Body;
    use axum::http::{Request as HttpRequest, StatusCode};
    use tower::util::ServiceExt;

    async fn test_state() -> (tempfile::TempDir, Arc<AppState>) {
        let dir = tempfile::tempdir().unwrap();
        let pool = db::memory_pool().await;
        let redis = RedisPool::new("redis://127.0.0.1:1/").unwrap();
        let storage = Arc::new(LocalStorage::new(dir.path().to_path_buf()));
        let cache = Arc::new(RedisStreamCache::new(redis.clone()));
        let jobs = Arc::new(db::SqlJobRepository::new(pool.clone()));
        let renditions = Arc::new(db::SqlRenditionRepository::new(pool.clone()));

        let streaming = StreamingService::new(
            storage.clone(),
            cache,
            jobs,
            renditions,
            StreamingOptions {
                cache_ttl_secs: 300,
                segment_duration: 10,
                configured_bitrates: vec![64, 128, 256],
                preload_limit: 10,
            },
        );
        let state = Arc::new(AppState {
            streaming,
            db: pool,
            redis,
            storage,
            cors_origins: Vec::new(),
        });
        (dir, state)
    }

    fn authed(uri: &str) -> HttpRequest<Body> {
        HttpRequest::builder()
            .uri(uri)
            .header("user_id", "user-1")
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn missing_user_id_is_unauthorized() {
        let (_dir, state) = test_state().await;
        let app = create_router(state);

        let response = app
            .oneshot(
                HttpRequest::builder()
                    .uri("/api/v1/stream/chapters/ch-1/status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn blank_user_id_is_unauthorized() {
        let (_dir, state) = test_state().await;
        let app = create_router(state);

        let response = app
            .oneshot(
                HttpRequest::builder()
                    .uri("/api/v1/stream/chapters/ch-1/status")
                    .header("user_id", "   ")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn status_of_unknown_chapter_is_ok_and_not_started() {
        let (_dir, state) = test_state().await;
        let app = create_router(state);

        let response = app
            .oneshot(authed("/api/v1/stream/chapters/ch-1/status"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["transcoding_status"], "not_started");
        assert_eq!(json["can_stream"], false);
    }

    #[tokio::test]
    async fn master_playlist_404s_without_renditions() {
        let (_dir, state) = test_state().await;
        let app = create_router(state);

        let response = app
            .oneshot(authed("/api/v1/stream/chapters/ch-1/master.m3u8"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn non_numeric_bitrate_is_a_bad_request() {
        let (_dir, state) = test_state().await;
        let app = create_router(state);

        let response = app
            .oneshot(authed("/api/v1/stream/chapters/ch-1/abc/playlist.m3u8"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn segment_is_served_from_storage() {
        let (_dir, state) = test_state().await;

        // Seed one completed rendition and its artifact.
        state
            .storage
            .upload_bytes(b"ts-bytes", "bit_transcode/ch-1/128k/segment_000.ts", "video/mp2t")
            .await
            .unwrap();
        let renditions = db::SqlRenditionRepository::new(state.db.clone());
        renditions
            .upsert(&Rendition::completed(
                "ch-1",
                128,
                "bit_transcode/ch-1/128k/playlist.m3u8".into(),
                "bit_transcode/ch-1/128k".into(),
                "local",
            ))
            .await
            .unwrap();

        let app = create_router(state);
        let response = app
            .oneshot(authed(
                "/api/v1/stream/chapters/ch-1/128/segments/ch-1_128_000",
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "video/mp2t"
        );
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"ts-bytes");
    }
}
