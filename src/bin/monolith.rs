//! Monolith binary - every component in one process.
//!
//! Wires up:
//! - SQLite state store and Redis broker/cache
//! - storage provider selected by configuration
//! - intake, bitrate, master, and deletion workers
//! - the streaming HTTP server

use callas::adapters::db::{self, SqlJobRepository, SqlRenditionRepository};
use callas::adapters::ffmpeg::FfmpegEncoder;
use callas::adapters::http::{create_router, AppState};
use callas::adapters::redis::{
    RedisDeletionQueue, RedisIntakeQueue, RedisPool, RedisStreamCache, RedisWorkQueue,
    WorkQueuePolicy,
};
use callas::adapters::storage;
use callas::application::bitrate::BitrateWorker;
use callas::application::deletion::DeletionWorker;
use callas::application::intake::IntakeService;
use callas::application::master::MasterWorker;
use callas::application::streaming::{StreamingOptions, StreamingService};
use callas::domain::jobs::{bitrate_queue, MASTER_QUEUE};
use callas::ports::queue::WorkQueuePort;
use callas::Config;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Encoder passes per bitrate queue.
const BITRATE_CONCURRENCY: usize = 2;

/// Bound on draining in-flight jobs at shutdown.
const DRAIN_DEADLINE: Duration = Duration::from_secs(30);

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
    let broker = if config.broker_url == config.redis_url {
        redis.clone()
    } else {
        match RedisPool::new(&config.broker_url) {
            Ok(broker) => broker,
            Err(err) => {
                error!(%err, "failed to create the broker pool");
                std::process::exit(1);
            }
        }
    };

    let storage = storage::from_config(&config).await;
    let cache = Arc::new(RedisStreamCache::new(redis.clone()));
    let jobs = Arc::new(SqlJobRepository::new(pool.clone()));
    let renditions = Arc::new(SqlRenditionRepository::new(pool.clone()));
    let work = Arc::new(RedisWorkQueue::new(
        redis.clone(),
        WorkQueuePolicy {
            max_attempts: config.max_attempts,
            backoff_base_secs: config.backoff_delay_secs,
        },
    ));
    let intake_queue = Arc::new(RedisIntakeQueue::new(
        broker.clone(),
        config.intake_message_ttl_secs,
    ));
    let deletion_queue = Arc::new(RedisDeletionQueue::new(broker.clone()));
    let encoder = Arc::new(FfmpegEncoder::new(
        config.ffmpeg_path.clone(),
        config.ffprobe_path.clone(),
    ));

    // Jobs stranded by a previous crash go back on their ready lists.
    for bitrate in &config.bitrates {
        recover(work.as_ref(), &bitrate_queue(*bitrate)).await;
    }
    recover(work.as_ref(), MASTER_QUEUE).await;

    let cancel = CancellationToken::new();
    let mut handles = Vec::new();

    let intake = Arc::new(IntakeService::new(
        intake_queue.clone(),
        work.clone(),
        jobs.clone(),
        renditions.clone(),
        config.hls_segment_duration,
    ));
    for worker_id in 0..config.intake_concurrency {
        let intake = intake.clone();
        let cancel = cancel.clone();
        handles.push(tokio::spawn(async move {
            intake.run(worker_id, cancel).await;
        }));
    }

    for &bitrate in &config.bitrates {
        let worker = Arc::new(BitrateWorker::new(
            storage.clone(),
            work.clone(),
            jobs.clone(),
            renditions.clone(),
            encoder.clone(),
            config.env,
            config.storage_root.clone(),
            Duration::from_secs(config.job_timeout_secs),
            bitrate_queue(bitrate),
        ));
        for worker_id in 0..BITRATE_CONCURRENCY {
            let worker = worker.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                worker.run(worker_id, cancel).await;
            }));
        }
    }

    let master = Arc::new(MasterWorker::new(
        storage.clone(),
        work.clone(),
        jobs.clone(),
        renditions.clone(),
        MASTER_QUEUE.to_string(),
    ));
    {
        let master = master.clone();
        let cancel = cancel.clone();
        handles.push(tokio::spawn(async move {
            master.run(cancel).await;
        }));
    }

    let deletion = Arc::new(DeletionWorker::new(
        storage.clone(),
        cache.clone(),
        deletion_queue.clone(),
        renditions.clone(),
    ));
    {
        let deletion = deletion.clone();
        let cancel = cancel.clone();
        handles.push(tokio::spawn(async move {
            deletion.run(cancel).await;
        }));
    }
    info!(
        bitrates = ?config.bitrates,
        intake = config.intake_concurrency,
        "transcoding workers started"
    );

    let streaming = StreamingService::new(
        storage.clone(),
        cache.clone(),
        jobs.clone(),
        renditions.clone(),
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
        .with_graceful_shutdown(shutdown_signal(cancel.clone()))
        .await
    {
        error!(%err, "server error");
    }

    cancel.cancel();
    drain(handles).await;
    info!("shutdown complete");
}

async fn recover<W: WorkQueuePort>(work: &W, queue: &str) {
    match work.recover(queue).await {
        Ok(0) => {}
        Ok(count) => info!(queue, count, "requeued stranded jobs"),
        Err(err) => warn!(queue, %err, "queue recovery failed"),
    }
}

async fn drain(handles: Vec<tokio::task::JoinHandle<()>>) {
    let all = async {
        for handle in handles {
            let _ = handle.await;
        }
    };
    if tokio::time::timeout(DRAIN_DEADLINE, all).await.is_err() {
        warn!("drain deadline hit, abandoning in-flight work");
    }
}

async fn shutdown_signal(cancel: CancellationToken) {
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
    info!("shutdown signal received, draining in-flight jobs");
    cancel.cancel();
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
