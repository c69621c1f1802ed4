//! Queue message types.
//!
//! Every message crossing a broker boundary is serde JSON; the shapes here
//! are the wire contract shared with the upstream ingestion service.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Name of the work queue holding master-playlist assembly jobs.
pub const MASTER_QUEUE: &str = "transcode:master";

/// Topic carrying chapter deletion notices.
pub const DELETION_TOPIC: &str = "audiobook.chapters.deleted";

/// Work queue for a single bitrate, e.g. `transcode:128k`.
pub fn bitrate_queue(bitrate: u32) -> String {
    format!("transcode:{}k", bitrate)
}

/// Coarse cross-chapter priority carried by intake messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    /// Numeric weight used for fine-grained ordering inside work queues.
    pub fn weight(self) -> u8 {
        match self {
            Priority::High => 10,
            Priority::Normal => 5,
            Priority::Low => 1,
        }
    }

    /// Intake routing key.
    pub fn route(self) -> &'static str {
        match self {
            Priority::High => "priority",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }
}

/// Chapter metadata as published by the ingestion service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChapterSummary {
    pub id: String,
    pub audiobook_id: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub chapter_number: u32,
    /// Duration in seconds
    pub duration: f64,
    pub file_path: String,
    pub file_size: u64,
    pub start_position: f64,
    pub end_position: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A request to transcode one chapter into a set of bitrate renditions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscodeRequest {
    pub chapter: ChapterSummary,
    pub bitrates: Vec<u32>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
    pub timestamp: DateTime<Utc>,
}

impl TranscodeRequest {
    pub fn message_id(&self) -> String {
        format!("{}-{}", self.chapter.id, self.timestamp.timestamp_millis())
    }
}

/// One bitrate's worth of encoder work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BitrateJob {
    pub chapter_id: String,
    pub input_path: String,
    /// Key prefix the rendition is published under, `bit_transcode/{chapter_id}`
    pub output_dir: String,
    pub bitrate: u32,
    pub segment_duration: u32,
    #[serde(default)]
    pub user_id: Option<String>,
}

impl BitrateJob {
    /// Deduplicating job id.
    pub fn job_id(&self, enqueued_at: DateTime<Utc>) -> String {
        format!(
            "{}-{}k-{}",
            self.chapter_id,
            self.bitrate,
            enqueued_at.timestamp_millis()
        )
    }

    pub fn rendition_prefix(&self) -> String {
        format!("{}/{}k", self.output_dir, self.bitrate)
    }
}

/// The fan-in step: wait for renditions, then publish the master playlist.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterJob {
    pub chapter_id: String,
    pub output_dir: String,
    pub variant_bitrates: Vec<u32>,
}

impl MasterJob {
    pub fn master_key(&self) -> String {
        format!("{}/master.m3u8", self.output_dir)
    }
}

/// Deletion notice consumed from [`DELETION_TOPIC`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChapterDeletion {
    pub chapter_id: String,
    pub timestamp: DateTime<Utc>,
}

/// Key prefix all artifacts of a chapter live under.
pub fn chapter_prefix(chapter_id: &str) -> String {
    format!("bit_transcode/{}", chapter_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn chapter() -> ChapterSummary {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        ChapterSummary {
            id: "ch-1".into(),
            audiobook_id: "book-1".into(),
            title: "Chapter One".into(),
            description: None,
            chapter_number: 1,
            duration: 60.0,
            file_path: "uploads/ch-1.mp3".into(),
            file_size: 1024,
            start_position: 0.0,
            end_position: 60.0,
            created_at: at,
            updated_at: at,
        }
    }

    #[test]
    fn priority_weights_match_routes() {
        assert_eq!(Priority::High.weight(), 10);
        assert_eq!(Priority::Normal.weight(), 5);
        assert_eq!(Priority::Low.weight(), 1);
        assert_eq!(Priority::High.route(), "priority");
        assert_eq!(Priority::Low.route(), "low");
    }

    #[test]
    fn message_id_combines_chapter_and_epoch_millis() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let request = TranscodeRequest {
            chapter: chapter(),
            bitrates: vec![64],
            priority: Priority::Normal,
            user_id: None,
            retry_count: 0,
            timestamp: at,
        };
        assert_eq!(
            request.message_id(),
            format!("ch-1-{}", at.timestamp_millis())
        );
    }

    #[test]
    fn bitrate_job_id_carries_bitrate_suffix() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let job = BitrateJob {
            chapter_id: "ch-1".into(),
            input_path: "uploads/ch-1.mp3".into(),
            output_dir: chapter_prefix("ch-1"),
            bitrate: 128,
            segment_duration: 10,
            user_id: None,
        };
        let id = job.job_id(at);
        assert!(id.starts_with("ch-1-128k-"));
        assert_eq!(job.rendition_prefix(), "bit_transcode/ch-1/128k");
    }

    #[test]
    fn intake_message_round_trips_with_defaults() {
        let json = serde_json::json!({
            "chapter": serde_json::to_value(chapter()).unwrap(),
            "bitrates": [64, 128],
            "priority": "high",
            "timestamp": "2024-05-01T12:00:00Z",
        });
        let request: TranscodeRequest = serde_json::from_value(json).unwrap();
        assert_eq!(request.priority, Priority::High);
        assert_eq!(request.retry_count, 0);
        assert!(request.user_id.is_none());
    }
}
