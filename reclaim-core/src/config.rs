//! Effective pipeline configuration: staging budgets, NVENC parameter
//! tables, audio handling mode, and the ordered priority tier list.
//!
//! Defaults mirror the values this pipeline has always shipped with, keyed
//! by content type (movie/series) and resolution class (res key).

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::model::WorkItem;

/// Per-res-key encode parameters for one content type.
pub type ParamTable<T> = HashMap<String, T>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentParams<T> {
    pub movie: ParamTable<T>,
    pub series: ParamTable<T>,
}

impl<T: Clone> ContentParams<T> {
    pub fn get(&self, content_type: &str, res_key: &str, default: T) -> T {
        let table = if content_type == "movie" { &self.movie } else { &self.series };
        table.get(res_key).cloned().unwrap_or(default)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriorityTier {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub codec: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,
    #[serde(default)]
    pub min_bitrate_kbps: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_bitrate_kbps: Option<f64>,
}

impl PriorityTier {
    pub fn matches(&self, item: &WorkItem) -> bool {
        if let Some(codec) = &self.codec {
            if codec != &item.video_codec {
                return false;
            }
        }
        if let Some(resolution) = &self.resolution {
            if resolution != &item.resolution_class {
                return false;
            }
        }
        if item.bitrate_kbps < self.min_bitrate_kbps {
            return false;
        }
        if let Some(max) = self.max_bitrate_kbps {
            if item.bitrate_kbps > max {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioMode {
    Copy,
    Smart,
}

/// Parameters resolved for one item, after tier lookup and any per-file
/// gentle override has been applied.
#[derive(Debug, Clone)]
pub struct EncodeParams {
    pub cq: i32,
    pub preset: String,
    pub multipass: String,
    pub lookahead: u32,
    pub maxrate: Option<String>,
    pub bufsize: Option<String>,
    pub content_type: String,
    pub res_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub max_staging_bytes: i64,
    pub max_fetch_buffer_bytes: i64,
    pub min_free_space_bytes: i64,

    pub video_codec: String,

    pub cq: ContentParams<i32>,
    pub nvenc_preset: ContentParams<String>,
    pub nvenc_multipass: ContentParams<String>,
    pub nvenc_lookahead: ContentParams<u32>,
    pub nvenc_maxrate: ContentParams<Option<String>>,
    pub nvenc_bufsize: ContentParams<Option<String>>,

    pub pixel_format_hdr: String,
    pub pixel_format_sdr: String,

    pub audio_mode: AudioMode,
    pub audio_eac3_surround_bitrate: String,
    pub audio_eac3_stereo_bitrate: String,
    pub lossless_audio_codecs: HashSet<String>,

    pub overwrite_existing: bool,
    pub replace_original: bool,
    pub verify_duration_tolerance_secs: f64,

    pub priority_tiers: Vec<PriorityTier>,
}

/// Extensions of containers known to trip the encoder's demuxer; remuxed to
/// `.mkv` via stream copy before encoding.
pub const REMUX_EXTENSIONS: &[&str] =
    &[".m2ts", ".avi", ".wmv", ".ts", ".m2v", ".vob", ".mpg", ".mpeg", ".mp4"];

fn table<T: Clone>(movie: &[(&str, T)], series: &[(&str, T)]) -> ContentParams<T> {
    ContentParams {
        movie: movie.iter().map(|(k, v)| (k.to_string(), v.clone())).collect(),
        series: series.iter().map(|(k, v)| (k.to_string(), v.clone())).collect(),
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            max_staging_bytes: 2_500_000_000_000,
            max_fetch_buffer_bytes: 500_000_000_000,
            min_free_space_bytes: 50_000_000_000,

            video_codec: "av1_nvenc".to_string(),

            cq: table(
                &[("4K_HDR", 22), ("4K_SDR", 27), ("1080p", 28), ("720p", 30), ("480p", 30), ("SD", 30)],
                &[("4K_HDR", 24), ("4K_SDR", 30), ("1080p", 30), ("720p", 32), ("480p", 32), ("SD", 32)],
            ),
            nvenc_preset: table(
                &[
                    ("4K_HDR", "p7".to_string()), ("4K_SDR", "p5".to_string()), ("1080p", "p5".to_string()),
                    ("720p", "p4".to_string()), ("480p", "p4".to_string()), ("SD", "p4".to_string()),
                ],
                &[
                    ("4K_HDR", "p5".to_string()), ("4K_SDR", "p4".to_string()), ("1080p", "p4".to_string()),
                    ("720p", "p4".to_string()), ("480p", "p4".to_string()), ("SD", "p4".to_string()),
                ],
            ),
            nvenc_multipass: table(
                &[
                    ("4K_HDR", "fullres".to_string()), ("4K_SDR", "qres".to_string()), ("1080p", "qres".to_string()),
                    ("720p", "disabled".to_string()), ("480p", "disabled".to_string()), ("SD", "disabled".to_string()),
                ],
                &[
                    ("4K_HDR", "qres".to_string()), ("4K_SDR", "disabled".to_string()), ("1080p", "disabled".to_string()),
                    ("720p", "disabled".to_string()), ("480p", "disabled".to_string()), ("SD", "disabled".to_string()),
                ],
            ),
            nvenc_lookahead: table(
                &[("4K_HDR", 32), ("4K_SDR", 24), ("1080p", 24), ("720p", 16), ("480p", 16), ("SD", 16)],
                &[("4K_HDR", 24), ("4K_SDR", 16), ("1080p", 16), ("720p", 16), ("480p", 16), ("SD", 16)],
            ),
            nvenc_maxrate: table(
                &[
                    ("4K_HDR", Some("40M".to_string())),
                    ("4K_SDR", Some("20M".to_string())),
                    ("1080p", Some("20M".to_string())),
                    ("720p", None), ("480p", None), ("SD", None),
                ],
                &[
                    ("4K_HDR", Some("20M".to_string())),
                    ("4K_SDR", None), ("1080p", None), ("720p", None), ("480p", None), ("SD", None),
                ],
            ),
            nvenc_bufsize: table(
                &[
                    ("4K_HDR", Some("80M".to_string())),
                    ("4K_SDR", Some("40M".to_string())),
                    ("1080p", Some("40M".to_string())),
                    ("720p", None), ("480p", None), ("SD", None),
                ],
                &[
                    ("4K_HDR", Some("40M".to_string())),
                    ("4K_SDR", None), ("1080p", None), ("720p", None), ("480p", None), ("SD", None),
                ],
            ),

            pixel_format_hdr: "p010le".to_string(),
            pixel_format_sdr: "p010le".to_string(),

            audio_mode: AudioMode::Smart,
            audio_eac3_surround_bitrate: "640k".to_string(),
            audio_eac3_stereo_bitrate: "256k".to_string(),
            lossless_audio_codecs: [
                "truehd", "dts-hd ma", "dts-hd.ma", "flac", "pcm_s16le", "pcm_s24le",
                "pcm_s32le", "pcm_f32le", "pcm_s16be", "pcm_s24be", "pcm_s32be", "pcm_f32be", "alac",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),

            overwrite_existing: false,
            replace_original: true,
            verify_duration_tolerance_secs: 2.0,

            priority_tiers: vec![
                PriorityTier { name: "H.264 1080p".into(), codec: Some("H.264".into()), resolution: Some("1080p".into()), min_bitrate_kbps: 0.0, max_bitrate_kbps: None },
                PriorityTier { name: "Bloated HEVC 1080p".into(), codec: Some("HEVC (H.265)".into()), resolution: Some("1080p".into()), min_bitrate_kbps: 15000.0, max_bitrate_kbps: None },
                PriorityTier { name: "Bloated HEVC 4K".into(), codec: Some("HEVC (H.265)".into()), resolution: Some("4K".into()), min_bitrate_kbps: 25000.0, max_bitrate_kbps: None },
                PriorityTier { name: "H.264 720p/other".into(), codec: Some("H.264".into()), resolution: None, min_bitrate_kbps: 0.0, max_bitrate_kbps: None },
                PriorityTier { name: "HEVC 1080p".into(), codec: Some("HEVC (H.265)".into()), resolution: Some("1080p".into()), min_bitrate_kbps: 0.0, max_bitrate_kbps: Some(15000.0) },
                PriorityTier { name: "HEVC 4K >20Mbps".into(), codec: Some("HEVC (H.265)".into()), resolution: Some("4K".into()), min_bitrate_kbps: 20000.0, max_bitrate_kbps: Some(25000.0) },
                PriorityTier { name: "HEVC 4K <=20Mbps".into(), codec: Some("HEVC (H.265)".into()), resolution: Some("4K".into()), min_bitrate_kbps: 0.0, max_bitrate_kbps: Some(20000.0) },
                PriorityTier { name: "HEVC 720p/SD + other".into(), codec: Some("HEVC (H.265)".into()), resolution: None, min_bitrate_kbps: 0.0, max_bitrate_kbps: None },
                PriorityTier { name: "Other codecs".into(), codec: None, resolution: None, min_bitrate_kbps: 0.0, max_bitrate_kbps: None },
            ],
        }
    }
}

impl Config {
    pub fn resolve_encode_params(&self, item: &WorkItem) -> EncodeParams {
        let content_type = item.library_type.content_type().to_string();
        let res_key = item.res_key();

        EncodeParams {
            cq: self.cq.get(&content_type, &res_key, 30),
            preset: self.nvenc_preset.get(&content_type, &res_key, "p4".to_string()),
            multipass: self.nvenc_multipass.get(&content_type, &res_key, "disabled".to_string()),
            lookahead: self.nvenc_lookahead.get(&content_type, &res_key, 16),
            maxrate: self.nvenc_maxrate.get(&content_type, &res_key, None),
            bufsize: self.nvenc_bufsize.get(&content_type, &res_key, None),
            content_type,
            res_key,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AudioStream, LibraryType, WorkItem};

    fn item(codec: &str, res: &str, hdr: bool, library: LibraryType) -> WorkItem {
        WorkItem {
            filepath: "x".into(),
            filename: "x.mkv".into(),
            file_size_bytes: 1,
            file_size_gb: 0.0,
            duration_seconds: 1.0,
            bitrate_kbps: 1.0,
            video_codec: codec.into(),
            video_codec_raw: codec.to_lowercase(),
            resolution_class: res.into(),
            hdr,
            bit_depth: 8,
            audio_streams: Vec::<AudioStream>::new(),
            subtitle_count: 0,
            library_type: library,
            priority_tier: 0,
            tier_name: "x".into(),
        }
    }

    #[test]
    fn resolves_movie_4k_hdr_params() {
        let cfg = Config::default();
        let params = cfg.resolve_encode_params(&item("HEVC (H.265)", "4K", true, LibraryType::Movie));
        assert_eq!(params.cq, 22);
        assert_eq!(params.preset, "p7");
        assert_eq!(params.multipass, "fullres");
        assert_eq!(params.maxrate.as_deref(), Some("40M"));
        assert_eq!(params.res_key, "4K_HDR");
    }

    #[test]
    fn resolves_series_720p_falls_back_to_no_maxrate() {
        let cfg = Config::default();
        let params = cfg.resolve_encode_params(&item("H.264", "720p", false, LibraryType::Series));
        assert_eq!(params.cq, 32);
        assert_eq!(params.maxrate, None);
        assert_eq!(params.content_type, "series");
    }

    #[test]
    fn tier_matching_respects_bitrate_bounds() {
        let tier = PriorityTier {
            name: "HEVC 4K <=20Mbps".into(),
            codec: Some("HEVC (H.265)".into()),
            resolution: Some("4K".into()),
            min_bitrate_kbps: 0.0,
            max_bitrate_kbps: Some(20000.0),
        };
        let mut i = item("HEVC (H.265)", "4K", false, LibraryType::Movie);
        i.bitrate_kbps = 19000.0;
        assert!(tier.matches(&i));
        i.bitrate_kbps = 21000.0;
        assert!(!tier.matches(&i));
    }
}
