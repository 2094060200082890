//! The data model: work items pulled from the media report, the durable
//! per-file record, and the denormalized stats block.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Resolution class as reported by the media probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    #[serde(rename = "4K")]
    Uhd,
    #[serde(rename = "1080p")]
    Fhd,
    #[serde(rename = "720p")]
    Hd,
    #[serde(rename = "480p")]
    Sd480,
    #[serde(rename = "SD")]
    Sd,
}

impl Resolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            Resolution::Uhd => "4K",
            Resolution::Fhd => "1080p",
            Resolution::Hd => "720p",
            Resolution::Sd480 => "480p",
            Resolution::Sd => "SD",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LibraryType {
    Movie,
    Series,
    Show,
    Tv,
    Anime,
}

impl LibraryType {
    /// Collapses the report's five library types down to the two content
    /// types the encode-parameter tables are keyed by.
    pub fn content_type(&self) -> &'static str {
        match self {
            LibraryType::Movie => "movie",
            _ => "series",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioStream {
    pub codec: String,
    pub codec_raw: String,
    pub lossless: bool,
    pub channels: u32,
    pub language: Option<String>,
}

/// One row in the run queue: report metadata plus the priority tier it was
/// assigned to during queue construction. Immutable for the life of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub filepath: String,
    pub filename: String,
    pub file_size_bytes: i64,
    pub file_size_gb: f64,
    pub duration_seconds: f64,
    pub bitrate_kbps: f64,
    pub video_codec: String,
    pub video_codec_raw: String,
    pub resolution_class: String,
    pub hdr: bool,
    pub bit_depth: u32,
    pub audio_streams: Vec<AudioStream>,
    pub subtitle_count: u32,
    pub library_type: LibraryType,
    pub priority_tier: usize,
    pub tier_name: String,
}

impl WorkItem {
    pub fn res_key(&self) -> String {
        if self.resolution_class == "4K" {
            if self.hdr {
                "4K_HDR".to_string()
            } else {
                "4K_SDR".to_string()
            }
        } else {
            self.resolution_class.clone()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Pending,
    Fetching,
    Fetched,
    Encoding,
    Encoded,
    Uploading,
    Uploaded,
    Verified,
    Replacing,
    Replaced,
    Skipped,
    Error,
}

impl FileStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FileStatus::Replaced | FileStatus::Verified | FileStatus::Skipped | FileStatus::Error
        )
    }

    /// Statuses the orchestrator treats as "partway through, keep driving".
    pub fn is_ready_to_advance(&self) -> bool {
        matches!(
            self,
            FileStatus::Fetched
                | FileStatus::Encoding
                | FileStatus::Encoded
                | FileStatus::Uploading
                | FileStatus::Uploaded
                | FileStatus::Replacing
        )
    }

    /// In-flight statuses whose durability depends on a temp file existing;
    /// missing that file at startup means the prior process died mid-stage.
    pub fn is_zombie_candidate(&self) -> bool {
        matches!(
            self,
            FileStatus::Fetching | FileStatus::Encoding | FileStatus::Uploading
        )
    }
}

/// The durable, mutable record for one source path. Every field beyond
/// `status`/`added`/`last_updated` is optional because most are only
/// populated once the corresponding stage runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub status: FileStatus,
    pub added: chrono::DateTime<chrono::Utc>,
    pub last_updated: chrono::DateTime<chrono::Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_input_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_output_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_path: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_size_bytes: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_size_bytes: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes_saved: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression_ratio: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encode_time_secs: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub res_key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error_stage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl FileRecord {
    pub fn new(now: chrono::DateTime<chrono::Utc>) -> Self {
        FileRecord {
            status: FileStatus::Pending,
            added: now,
            last_updated: now,
            local_input_path: None,
            local_output_path: None,
            destination_path: None,
            final_path: None,
            backup_path: None,
            input_size_bytes: None,
            output_size_bytes: None,
            bytes_saved: None,
            compression_ratio: None,
            encode_time_secs: None,
            res_key: None,
            last_error: None,
            last_error_stage: None,
            reason: None,
        }
    }
}

/// Per-resolution-class rollup, summed across completed items of that class.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TierStats {
    #[serde(default)]
    pub completed: u64,
    #[serde(default)]
    pub bytes_saved: i64,
    #[serde(default)]
    pub total_input_bytes: i64,
    #[serde(default)]
    pub total_output_bytes: i64,
    #[serde(default)]
    pub total_encode_time_secs: f64,
}

/// Denormalized global counters kept current on every completed transition,
/// so reporting never has to rescan the full file map.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlobalStats {
    #[serde(default)]
    pub total_files: u64,
    #[serde(default)]
    pub completed: u64,
    #[serde(default)]
    pub skipped: u64,
    #[serde(default)]
    pub errors: u64,
    #[serde(default)]
    pub bytes_saved: i64,
    #[serde(default)]
    pub total_encode_time_secs: f64,
    #[serde(default)]
    pub tier_stats: HashMap<String, TierStats>,
}
