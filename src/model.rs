//! Shared data model (spec §3).
//!
//! The source this engine is modelled on uses dynamically-typed tagged
//! messages for everything; here each concept gets its own struct and the
//! `Message` sum type carries a single discriminator per variant, per the
//! REDESIGN note in spec §9.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoQuality {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub bitrate: Option<u64>,
    pub framerate: Option<f64>,
    pub label: String,
}

impl VideoQuality {
    pub fn new(width: Option<u32>, height: Option<u32>, bitrate: Option<u64>, framerate: Option<f64>) -> Self {
        let label = label_for(height, bitrate);
        Self {
            width,
            height,
            bitrate,
            framerate,
            label,
        }
    }
}

/// Shared label rule (spec §4.1, used identically by DASH per §4.2).
pub fn label_for(height: Option<u32>, bitrate: Option<u64>) -> String {
    if let Some(h) = height {
        return match h {
            2160 => "4K".to_string(),
            1440 => "1440p".to_string(),
            1080 => "1080p".to_string(),
            720 => "720p".to_string(),
            480 => "480p".to_string(),
            360 => "360p".to_string(),
            other => format!("{other}p"),
        };
    }
    if let Some(b) = bitrate {
        return if b >= 8_000_000 {
            "High".to_string()
        } else if b >= 4_000_000 {
            "Medium".to_string()
        } else {
            "Low".to_string()
        };
    }
    "Unknown".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioTrack {
    #[serde(default = "default_language")]
    pub language: String,
    pub bitrate: Option<u64>,
    pub label: String,
}

fn default_language() -> String {
    "und".to_string()
}

impl AudioTrack {
    pub fn new(language: Option<String>, bitrate: Option<u64>, label: String) -> Self {
        Self {
            language: language.unwrap_or_else(default_language),
            bitrate,
            label,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamType {
    Hls,
    Dash,
    Direct,
    Ytdlp,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protection {
    None,
    Drm,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedStream {
    pub id: Uuid,
    pub url: String,
    #[serde(rename = "type")]
    pub stream_type: StreamType,
    pub protection: Protection,
    pub qualities: Vec<VideoQuality>,
    pub audio_tracks: Vec<AudioTrack>,
    pub title: Option<String>,
    pub duration: Option<f64>,
    pub thumbnail: Option<String>,
    pub page_url: String,
    pub page_title: Option<String>,
    pub detected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Pending,
    Downloading,
    Merging,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DownloadProgress {
    pub downloaded_bytes: u64,
    pub total_bytes: u64,
    pub speed_bytes_per_sec: f64,
    pub eta_seconds: Option<u64>,
    pub percentage: f64,
    pub current_segment: Option<usize>,
    pub total_segments: Option<usize>,
}

impl DownloadProgress {
    /// Clamp invariants from spec §3: `downloaded <= total` when total is
    /// known, and `0 <= percentage <= 100`.
    pub fn normalize(mut self) -> Self {
        if self.total_bytes > 0 && self.downloaded_bytes > self.total_bytes {
            self.downloaded_bytes = self.total_bytes;
        }
        self.percentage = self.percentage.clamp(0.0, 100.0);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadJob {
    pub id: Uuid,
    pub stream: DetectedStream,
    pub quality: VideoQuality,
    pub audio: Option<AudioTrack>,
    pub status: DownloadStatus,
    pub progress: DownloadProgress,
    pub output_path: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl DownloadJob {
    pub fn new(stream: DetectedStream, quality: VideoQuality, audio: Option<AudioTrack>) -> Self {
        Self {
            id: Uuid::new_v4(),
            stream,
            quality,
            audio,
            status: DownloadStatus::Pending,
            progress: DownloadProgress::default(),
            output_path: None,
            error: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            DownloadStatus::Completed | DownloadStatus::Failed | DownloadStatus::Cancelled
        )
    }
}

/// Native-messaging wire message (spec §3, §4.4). One discriminator
/// (`type`) plus per-variant fields, flattened at the JSON level so the
/// extension sees `{"type": "...", "timestamp": ..., ...fields}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
    Ping {
        timestamp: i64,
    },
    Pong {
        timestamp: i64,
        version: String,
    },
    StreamDetected {
        timestamp: i64,
        stream: DetectedStream,
    },
    DownloadRequest {
        timestamp: i64,
        stream: DetectedStream,
        quality: VideoQuality,
        audio: Option<AudioTrack>,
        output_dir: Option<String>,
    },
    DownloadProgress {
        timestamp: i64,
        #[serde(rename = "jobId")]
        job_id: Uuid,
        progress: DownloadProgress,
        status: DownloadStatus,
    },
    DownloadComplete {
        timestamp: i64,
        #[serde(rename = "jobId")]
        job_id: Uuid,
        #[serde(rename = "outputPath")]
        output_path: String,
    },
    DownloadError {
        timestamp: i64,
        #[serde(rename = "jobId")]
        job_id: Uuid,
        error: String,
    },
    DownloadCancel {
        timestamp: i64,
        #[serde(rename = "jobId")]
        job_id: Uuid,
    },
    GetDownloads {
        timestamp: i64,
    },
    DownloadsList {
        timestamp: i64,
        downloads: Vec<DownloadJob>,
    },
    AppStatus {
        timestamp: i64,
        connected: bool,
        #[serde(rename = "encoderAvailable")]
        encoder_available: bool,
        #[serde(rename = "helperAvailable")]
        helper_available: bool,
        version: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_rule_prefers_height() {
        assert_eq!(label_for(Some(2160), None), "4K");
        assert_eq!(label_for(Some(1080), Some(1)), "1080p");
        assert_eq!(label_for(Some(900), None), "900p");
    }

    #[test]
    fn label_rule_falls_back_to_bitrate() {
        assert_eq!(label_for(None, Some(9_000_000)), "High");
        assert_eq!(label_for(None, Some(5_000_000)), "Medium");
        assert_eq!(label_for(None, Some(1_000_000)), "Low");
        assert_eq!(label_for(None, None), "Unknown");
    }

    #[test]
    fn progress_normalizes_invariants() {
        let p = DownloadProgress {
            downloaded_bytes: 200,
            total_bytes: 100,
            percentage: 150.0,
            ..Default::default()
        }
        .normalize();
        assert_eq!(p.downloaded_bytes, 100);
        assert_eq!(p.percentage, 100.0);
    }

    #[test]
    fn message_round_trips_through_json() {
        let msg = Message::DownloadProgress {
            timestamp: 1,
            job_id: Uuid::nil(),
            progress: DownloadProgress {
                downloaded_bytes: 10,
                total_bytes: 100,
                speed_bytes_per_sec: 5.0,
                eta_seconds: Some(18),
                percentage: 10.0,
                current_segment: Some(1),
                total_segments: Some(10),
            },
            status: DownloadStatus::Downloading,
        };
        let json = serde_json::to_string(&msg).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        match back {
            Message::DownloadProgress { progress, .. } => {
                assert_eq!(progress.downloaded_bytes, 10);
                assert_eq!(progress.total_segments, Some(10));
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }
}
