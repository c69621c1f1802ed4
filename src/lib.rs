//! Callas - Audiobook HLS Transcoding and Streaming Library
//!
//! Hexagonal Architecture:
//! - domain/: Pure business logic (jobs, rows, playlists)
//! - ports/: Trait definitions
//! - adapters/: Concrete implementations (Redis, SQLite, storage, ffmpeg, HTTP)
//! - application/: Workers and the streaming read-path service
//! - config: Environment configuration
//!
//! Binaries wire the pieces together:
//! - `monolith`: every worker plus the streaming HTTP server in one process
//! - `worker`: the write path only (intake, bitrate, master, deletion)
//! - `streamer`: the read path only

pub mod adapters;
pub mod application;
pub mod config;
pub mod domain;
pub mod error;
pub mod ports;

pub use config::Config;
pub use error::Error;
