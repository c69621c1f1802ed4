//! Environment configuration.
//!
//! Every recognized variable has a default suitable for local development;
//! unrecognized variables are ignored.

use std::env;
use std::path::PathBuf;

/// Deployment mode. Development mirrors remote source files into the local
/// storage root before staging; production requires the object to exist and
/// stages it directly.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AppEnv {
    Development,
    Production,
}

impl AppEnv {
    fn parse(value: &str) -> Self {
        match value {
            "production" => AppEnv::Production,
            _ => AppEnv::Development,
        }
    }

    pub fn is_development(self) -> bool {
        self == AppEnv::Development
    }
}

/// Which object-store provider to wire in at startup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StorageProviderKind {
    Local,
    S3,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub env: AppEnv,
    /// Streaming HTTP server port
    pub streaming_port: u16,
    /// SQLite connection URL
    pub database_url: String,
    /// Redis connection URL (cache and work queues)
    pub redis_url: String,
    /// Broker connection URL for the intake routes; falls back to Redis
    pub broker_url: String,
    /// Intake message TTL in seconds for the priority/normal routes;
    /// the low route gets twice this
    pub intake_message_ttl_secs: u64,
    /// Per-job encoder timeout in seconds
    pub job_timeout_secs: u64,
    /// Work-queue delivery attempts before a job is buried
    pub max_attempts: u32,
    /// Base for the exponential backoff between attempts, in seconds
    pub backoff_delay_secs: u64,
    pub storage_provider: StorageProviderKind,
    /// Root directory of the local provider, also used for staging
    pub storage_root: PathBuf,
    pub aws_region: String,
    pub aws_bucket: String,
    pub ffmpeg_path: String,
    pub ffprobe_path: String,
    /// Target HLS segment duration in seconds
    pub hls_segment_duration: u32,
    /// The fixed bitrate ladder, in kbps
    pub bitrates: Vec<u32>,
    /// TTL for cached playlists and segments, in seconds
    pub streaming_cache_ttl_secs: u64,
    /// Upper bound on segments loaded by one preload request
    pub preload_limit: usize,
    /// Allowed CORS origins; empty means any
    pub cors_origins: Vec<String>,
    /// Number of concurrent intake consumers
    pub intake_concurrency: usize,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();

        let redis_url = env::var("REDIS_URL").unwrap_or_else(|_| {
            let host = env::var("REDIS_HOST").unwrap_or_else(|_| String::from("127.0.0.1"));
            let port = env::var("REDIS_PORT").unwrap_or_else(|_| String::from("6379"));
            match env::var("REDIS_PASSWORD") {
                Ok(password) if !password.is_empty() => {
                    format!("redis://:{}@{}:{}/", password, host, port)
                }
                _ => format!("redis://{}:{}/", host, port),
            }
        });

        Self {
            env: AppEnv::parse(&env::var("NODE_ENV").unwrap_or_default()),
            streaming_port: env_parse("STREAMING_PORT", 3000),
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| String::from("sqlite:callas.db?mode=rwc")),
            broker_url: env::var("RABBITMQ_URL").unwrap_or_else(|_| redis_url.clone()),
            redis_url,
            intake_message_ttl_secs: env_parse("RABBITMQ_MESSAGE_TTL", 3600),
            job_timeout_secs: env_parse("BULL_JOB_TIMEOUT", 3600),
            max_attempts: env_parse("BULL_MAX_ATTEMPTS", 3),
            backoff_delay_secs: env_parse("BULL_BACKOFF_DELAY", 30),
            storage_provider: match env::var("STORAGE_PROVIDER").as_deref() {
                Ok("s3") => StorageProviderKind::S3,
                _ => StorageProviderKind::Local,
            },
            storage_root: PathBuf::from(
                env::var("STORAGE_LOCAL_ROOT").unwrap_or_else(|_| String::from("storage")),
            ),
            aws_region: env::var("AWS_REGION").unwrap_or_else(|_| String::from("us-east-1")),
            aws_bucket: env::var("AWS_S3_BUCKET").unwrap_or_default(),
            ffmpeg_path: env::var("FFMPEG_PATH").unwrap_or_else(|_| String::from("ffmpeg")),
            ffprobe_path: env::var("FFPROBE_PATH").unwrap_or_else(|_| String::from("ffprobe")),
            hls_segment_duration: env_parse("HLS_SEGMENT_DURATION", 10),
            bitrates: parse_bitrates(
                &env::var("TRANSCODING_BITRATES").unwrap_or_else(|_| String::from("64,128,256")),
            ),
            streaming_cache_ttl_secs: env_parse("STREAMING_CACHE_TTL", 300),
            preload_limit: env_parse("STREAMING_PRELOAD_LIMIT", 10),
            cors_origins: env::var("CORS_ORIGINS")
                .map(|v| {
                    v.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .or_else(|_| env::var("CLIENT_URL").map(|url| vec![url]))
                .unwrap_or_default(),
            intake_concurrency: env_parse("INTAKE_CONCURRENCY", 4),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_bitrates(value: &str) -> Vec<u32> {
    let mut bitrates: Vec<u32> = value
        .split(',')
        .filter_map(|s| s.trim().parse().ok())
        .collect();
    bitrates.sort_unstable();
    bitrates.dedup();
    if bitrates.is_empty() {
        vec![64, 128, 256]
    } else {
        bitrates
    }
}
