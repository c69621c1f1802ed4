//! Streamer binary - the read path only.

use callas::adapters::db::{self, SqlJobRepository, SqlRenditionRepository};
use callas::adapters::http::{create_router, AppState};
use callas::adapters::redis::{RedisPool, RedisStreamCache};
use callas::adapters::storage;
use callas::application::streaming::{StreamingOptions, StreamingService};
use callas::Config;
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    init_logging();
    let config = Config::from_env();

    let pool = match db::connect(&config.database_url).await {
        Ok(pool) => pool,
        Err(err) => {
            error!(%err, "failed to open the database");
            std::process::exit(1);
        }
    };
    let redis = match RedisPool::new(&config.redis_url) {
        Ok(redis) => redis,
        Err(err) => {
            error!(%err, "failed to create the Redis pool");
            std::process::exit(1);
        }
    };

    let storage = storage::from_config(&config).await;
    let cache = Arc::new(RedisStreamCache::new(redis.clone()));
    let jobs = Arc::new(SqlJobRepository::new(pool.clone()));
    let renditions = Arc::new(SqlRenditionRepository::new(pool.clone()));

    let streaming = StreamingService::new(
        storage.clone(),
        cache,
        jobs,
        renditions,
        StreamingOptions {
            cache_ttl_secs: config.streaming_cache_ttl_secs,
            segment_duration: config.hls_segment_duration,
            configured_bitrates: config.bitrates.clone(),
            preload_limit: config.preload_limit,
        },
    );
    let state = Arc::new(AppState {
        streaming,
        db: pool,
        redis,
        storage,
        cors_origins: config.cors_origins.clone(),
    });
    let app = create_router(state);

    let listener = match tokio::net::TcpListener::bind(("0.0.0.0", config.streaming_port)).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(%err, port = config.streaming_port, "failed to bind");
            std::process::exit(1);
        }
    };
    info!(port = config.streaming_port, "streaming server listening");

    if let Err(err) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!(%err, "server error");
    }
    info!("shutdown complete");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut usr2 =
            signal(SignalKind::user_defined2()).expect("failed to install SIGUSR2 handler");
        tokio::select! {
            _ = term.recv() => {}
            _ = usr2.recv() => {}
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
}

fn init_logging() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "callas=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
