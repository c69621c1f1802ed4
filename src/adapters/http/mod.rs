//! Streaming REST API.

pub mod error;
pub mod handlers;
pub mod routes;

use crate::adapters::redis::RedisPool;
use crate::application::streaming::StreamingService;
use crate::ports::storage::StoragePort;
use sqlx::sqlite::SqlitePool;
use std::sync::Arc;

pub use routes::create_router;

/// Everything the read-path handlers need.
pub struct AppState {
    pub streaming: StreamingService,
    pub db: SqlitePool,
    pub redis: RedisPool,
    pub storage: Arc<dyn StoragePort>,
    pub cors_origins: Vec<String>,
}
