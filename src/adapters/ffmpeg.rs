//! ffmpeg/ffprobe wrapper implementing [`EncoderPort`].
//!
//! Each transcode spawns one ffmpeg subprocess writing an HLS rendition
//! (playlist plus numbered MPEG-TS segments) into a local directory.
//! Progress is read from `-progress pipe:1` key/value output and mapped to
//! a percentage of the probed input duration. The subprocess is killed when
//! the timeout elapses or the surrounding future is dropped.

use crate::error::EncoderError;
use crate::ports::encoder::{EncodeSpec, EncoderPort};
use async_trait::async_trait;
use regex::Regex;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub struct FfmpegEncoder {
    ffmpeg: String,
    ffprobe: String,
}

impl FfmpegEncoder {
    pub fn new(ffmpeg: String, ffprobe: String) -> Self {
        Self { ffmpeg, ffprobe }
    }

    fn hls_args(spec: &EncodeSpec) -> Vec<String> {
        let dir = spec.output_dir.to_string_lossy();
        vec![
            "-y".into(),
            "-i".into(),
            spec.input.to_string_lossy().into_owned(),
            "-vn".into(),
            "-acodec".into(),
            "aac".into(),
            "-b:a".into(),
            format!("{}k", spec.bitrate_kbps),
            "-ac".into(),
            "2".into(),
            "-ar".into(),
            "44100".into(),
            "-f".into(),
            "hls".into(),
            "-hls_time".into(),
            spec.segment_duration.to_string(),
            "-hls_list_size".into(),
            "0".into(),
            "-hls_segment_filename".into(),
            format!("{}/segment_%03d.ts", dir),
            "-hls_flags".into(),
            "independent_segments".into(),
            "-progress".into(),
            "pipe:1".into(),
            "-nostats".into(),
            "-loglevel".into(),
            "error".into(),
            format!("{}/playlist.m3u8", dir),
        ]
    }

    /// `out_time_us`/`out_time_ms` both carry microseconds.
    fn parse_progress_line(line: &str) -> Option<u64> {
        let re = progress_re();
        re.captures(line)
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().parse().ok())
    }
}

fn progress_re() -> &'static Regex {
    use std::sync::OnceLock;
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^out_time_(?:us|ms)=(\d+)").unwrap())
}

#[async_trait]
impl EncoderPort for FfmpegEncoder {
    async fn probe_duration(&self, input: &Path) -> Result<f64, EncoderError> {
        let output = Command::new(&self.ffprobe)
            .arg("-v")
            .arg("error")
            .arg("-show_entries")
            .arg("format=duration")
            .arg("-of")
            .arg("default=noprint_wrappers=1:nokey=1")
            .arg(input)
            .output()
            .await
            .map_err(|source| EncoderError::Spawn {
                source,
                program: self.ffprobe.clone(),
            })?;

        if !output.status.success() {
            return Err(EncoderError::Probe(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        stdout
            .trim()
            .parse()
            .map_err(|_| EncoderError::Probe(format!("unparsable duration {:?}", stdout.trim())))
    }

    async fn transcode_hls(
        &self,
        spec: &EncodeSpec,
        timeout: Duration,
        progress: mpsc::Sender<u8>,
    ) -> Result<(), EncoderError> {
        tokio::fs::create_dir_all(&spec.output_dir).await?;

        let duration = match self.probe_duration(&spec.input).await {
            Ok(secs) if secs > 0.0 => Some(secs),
            Ok(_) => None,
            Err(err) => {
                warn!(input = %spec.input.display(), %err, "duration probe failed, progress disabled");
                None
            }
        };

        let mut child = Command::new(&self.ffmpeg)
            .args(Self::hls_args(spec))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| EncoderError::Spawn {
                source,
                program: self.ffmpeg.clone(),
            })?;

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                let mut last_sent = 0u8;
                while let Ok(Some(line)) = lines.next_line().await {
                    let Some(micros) = FfmpegEncoder::parse_progress_line(&line) else {
                        continue;
                    };
                    let Some(total) = duration else { continue };
                    let percent =
                        ((micros as f64 / 1_000_000.0) / total * 100.0).clamp(0.0, 99.0) as u8;
                    // Coarse updates only; the row does not need every tick.
                    if percent >= last_sent.saturating_add(5) {
                        last_sent = percent;
                        if progress.try_send(percent).is_err() {
                            debug!("progress receiver gone, stopping updates");
                            break;
                        }
                    }
                }
            });
        }

        let stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut buf = String::new();
                let _ = stderr.read_to_string(&mut buf).await;
                buf
            })
        });

        let status = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(result) => result?,
            Err(_) => {
                let _ = child.kill().await;
                return Err(EncoderError::Timeout(timeout.as_secs()));
            }
        };

        if status.success() {
            Ok(())
        } else {
            let stderr = match stderr_task {
                Some(task) => task.await.unwrap_or_default(),
                None => String::new(),
            };
            Err(EncoderError::Failed {
                status: status.to_string(),
                stderr: stderr.trim().to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn hls_args_encode_the_rendition_contract() {
        let spec = EncodeSpec {
            input: PathBuf::from("storage/temp/temp_1_ch.mp3"),
            output_dir: PathBuf::from("storage/bit_transcode/ch-1/128k"),
            bitrate_kbps: 128,
            segment_duration: 10,
        };
        let args = FfmpegEncoder::hls_args(&spec);
        let joined = args.join(" ");

        assert!(joined.contains("-acodec aac"));
        assert!(joined.contains("-b:a 128k"));
        assert!(joined.contains("-ac 2"));
        assert!(joined.contains("-ar 44100"));
        assert!(joined.contains("-f hls"));
        assert!(joined.contains("-hls_time 10"));
        assert!(joined.contains("-hls_list_size 0"));
        assert!(joined.contains("-hls_flags independent_segments"));
        assert!(joined.contains("segment_%03d.ts"));
        assert!(args.last().unwrap().ends_with("playlist.m3u8"));
    }

    #[test]
    fn progress_lines_parse_microseconds() {
        assert_eq!(
            FfmpegEncoder::parse_progress_line("out_time_us=1500000"),
            Some(1_500_000)
        );
        assert_eq!(
            FfmpegEncoder::parse_progress_line("out_time_ms=1500000"),
            Some(1_500_000)
        );
        assert_eq!(FfmpegEncoder::parse_progress_line("speed=1.5x"), None);
        assert_eq!(FfmpegEncoder::parse_progress_line("out_time_us=N/A"), None);
    }
}
