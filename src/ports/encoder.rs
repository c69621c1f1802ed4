use crate::error::EncoderError;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;

/// Parameters for one bitrate rendition.
#[derive(Debug, Clone)]
pub struct EncodeSpec {
    pub input: PathBuf,
    /// Local directory the playlist and segments are written into
    pub output_dir: PathBuf,
    pub bitrate_kbps: u32,
    pub segment_duration: u32,
}

/// External media encoder (ffmpeg-class). Each invocation spawns an isolated
/// subprocess; the subprocess is killed when the timeout elapses or the
/// returned future is dropped.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EncoderPort: Send + Sync {
    /// Media duration in seconds.
    async fn probe_duration(&self, input: &Path) -> Result<f64, EncoderError>;

    /// Segment and transcode `spec.input` into an HLS rendition, reporting
    /// coarse progress percentages on `progress` as encoding advances.
    async fn transcode_hls(
        &self,
        spec: &EncodeSpec,
        timeout: Duration,
        progress: mpsc::Sender<u8>,
    ) -> Result<(), EncoderError>;
}
