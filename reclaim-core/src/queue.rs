//! Transforms a media report plus the live state store into an ordered,
//! reproducible run queue.

use serde::Deserialize;
use tracing::info;

use crate::config::Config;
use crate::model::{AudioStream, FileStatus, LibraryType, WorkItem};
use crate::state::StateStore;

#[derive(Debug, Deserialize)]
struct ReportVideo {
    codec: String,
    codec_raw: String,
    resolution_class: String,
    hdr: bool,
    bit_depth: u32,
}

#[derive(Debug, Deserialize)]
struct ReportEntry {
    filepath: String,
    filename: String,
    file_size_bytes: i64,
    file_size_gb: f64,
    duration_seconds: f64,
    overall_bitrate_kbps: f64,
    video: ReportVideo,
    #[serde(default)]
    audio_streams: Vec<AudioStream>,
    #[serde(default)]
    subtitle_count: u32,
    library_type: LibraryType,
}

#[derive(Debug, Deserialize)]
struct Report {
    files: Vec<ReportEntry>,
}

/// Builds the run queue from `report_json`, skipping entries already at the
/// target codec, of unknown codec, or already in a terminal state in
/// `store`. The result is sorted by (priority tier ascending, file size
/// descending) and is reproducible for identical inputs.
pub fn build_priority_queue(
    report_json: &str,
    config: &Config,
    store: &StateStore,
) -> anyhow::Result<Vec<WorkItem>> {
    let report: Report = serde_json::from_str(report_json)?;
    let mut items = Vec::new();
    let mut tier_counts = vec![0usize; config.priority_tiers.len() + 1];
    let total_files = report.files.len() as u64;

    for entry in report.files {
        if entry.video.codec_raw.eq_ignore_ascii_case("av1") {
            mark_skipped(store, &entry.filepath, "already target codec")?;
            continue;
        }
        if entry.video.codec.eq_ignore_ascii_case("unknown") {
            mark_skipped(store, &entry.filepath, "unknown codec")?;
            continue;
        }
        if let Some(record) = store.get_file(&entry.filepath) {
            if record.status.is_terminal() {
                continue;
            }
        }

        let mut item = WorkItem {
            filepath: entry.filepath,
            filename: entry.filename,
            file_size_bytes: entry.file_size_bytes,
            file_size_gb: entry.file_size_gb,
            duration_seconds: entry.duration_seconds,
            bitrate_kbps: entry.overall_bitrate_kbps,
            video_codec: entry.video.codec,
            video_codec_raw: entry.video.codec_raw,
            resolution_class: entry.video.resolution_class,
            hdr: entry.video.hdr,
            bit_depth: entry.video.bit_depth,
            audio_streams: entry.audio_streams,
            subtitle_count: entry.subtitle_count,
            library_type: entry.library_type,
            priority_tier: config.priority_tiers.len(),
            tier_name: "Other codecs".to_string(),
        };

        for (idx, tier) in config.priority_tiers.iter().enumerate() {
            if tier.matches(&item) {
                item.priority_tier = idx;
                item.tier_name = tier.name.clone();
                break;
            }
        }
        tier_counts[item.priority_tier] += 1;
        items.push(item);
    }

    items.sort_by(|a, b| {
        a.priority_tier
            .cmp(&b.priority_tier)
            .then(b.file_size_bytes.cmp(&a.file_size_bytes))
    });

    log_tier_breakdown(config, &tier_counts);
    store.update_stats(|s| s.total_files = total_files)?;
    Ok(items)
}

/// Builds a WorkItem for every report entry regardless of status, tier-less
/// (`priority_tier` 0, unused). Used only to resolve a priority-bumped path
/// that isn't in the run queue — e.g. it was previously skipped — back into
/// a full WorkItem so it can be injected.
pub fn build_report_index(report_json: &str) -> anyhow::Result<Vec<WorkItem>> {
    let report: Report = serde_json::from_str(report_json)?;
    Ok(report
        .files
        .into_iter()
        .map(|entry| WorkItem {
            filepath: entry.filepath,
            filename: entry.filename,
            file_size_bytes: entry.file_size_bytes,
            file_size_gb: entry.file_size_gb,
            duration_seconds: entry.duration_seconds,
            bitrate_kbps: entry.overall_bitrate_kbps,
            video_codec: entry.video.codec,
            video_codec_raw: entry.video.codec_raw,
            resolution_class: entry.video.resolution_class,
            hdr: entry.video.hdr,
            bit_depth: entry.video.bit_depth,
            audio_streams: entry.audio_streams,
            subtitle_count: entry.subtitle_count,
            library_type: entry.library_type,
            priority_tier: 0,
            tier_name: String::new(),
        })
        .collect())
}

fn mark_skipped(store: &StateStore, filepath: &str, reason: &str) -> anyhow::Result<()> {
    if let Some(record) = store.get_file(filepath) {
        if record.status.is_terminal() {
            return Ok(());
        }
    }
    store.set_file(filepath, |r| {
        r.status = FileStatus::Skipped;
        r.reason = Some(reason.to_string());
    })?;
    store.update_stats(|s| s.skipped += 1)?;
    Ok(())
}

fn log_tier_breakdown(config: &Config, tier_counts: &[usize]) {
    for (idx, tier) in config.priority_tiers.iter().enumerate() {
        if tier_counts[idx] > 0 {
            info!(tier = %tier.name, count = tier_counts[idx], "queue tier");
        }
    }
    let other = tier_counts[config.priority_tiers.len()];
    if other > 0 {
        info!(tier = "Other codecs", count = other, "queue tier");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn report() -> String {
        serde_json::json!({
            "files": [
                {
                    "filepath": "/media/a.mkv", "filename": "a.mkv",
                    "file_size_bytes": 5_000_000_000i64, "file_size_gb": 5.0,
                    "duration_seconds": 3600.0, "overall_bitrate_kbps": 8000.0,
                    "video": {"codec": "H.264", "codec_raw": "h264", "resolution_class": "1080p", "hdr": false, "bit_depth": 8},
                    "audio_streams": [], "subtitle_count": 0, "library_type": "movie"
                },
                {
                    "filepath": "/media/b.mkv", "filename": "b.mkv",
                    "file_size_bytes": 40_000_000_000i64, "file_size_gb": 40.0,
                    "duration_seconds": 7200.0, "overall_bitrate_kbps": 30000.0,
                    "video": {"codec": "HEVC (H.265)", "codec_raw": "hevc", "resolution_class": "4K", "hdr": false, "bit_depth": 8},
                    "audio_streams": [], "subtitle_count": 0, "library_type": "movie"
                },
                {
                    "filepath": "/media/c.mkv", "filename": "c.mkv",
                    "file_size_bytes": 2_000_000_000i64, "file_size_gb": 2.0,
                    "duration_seconds": 3600.0, "overall_bitrate_kbps": 4000.0,
                    "video": {"codec": "AV1", "codec_raw": "av1", "resolution_class": "1080p", "hdr": false, "bit_depth": 10},
                    "audio_streams": [], "subtitle_count": 0, "library_type": "movie"
                }
            ]
        })
        .to_string()
    }

    #[test]
    fn scenario_1_tier_ordering_and_av1_skip() {
        let dir = tempdir().unwrap();
        let store = StateStore::load_or_create(&dir.path().join("state.json"), Config::default()).unwrap();
        let queue = build_priority_queue(&report(), &Config::default(), &store).unwrap();

        assert_eq!(queue.len(), 2);
        assert_eq!(queue[0].filepath, "/media/a.mkv");
        assert_eq!(queue[1].filepath, "/media/b.mkv");
        assert_eq!(store.get_file("/media/c.mkv").unwrap().status, FileStatus::Skipped);
    }

    #[test]
    fn build_priority_queue_populates_global_stats() {
        let dir = tempdir().unwrap();
        let store = StateStore::load_or_create(&dir.path().join("state.json"), Config::default()).unwrap();
        build_priority_queue(&report(), &Config::default(), &store).unwrap();

        let stats = store.stats();
        assert_eq!(stats.total_files, 3);
        assert_eq!(stats.skipped, 1);
    }

    #[test]
    fn queue_build_is_deterministic() {
        let dir = tempdir().unwrap();
        let store = StateStore::load_or_create(&dir.path().join("state.json"), Config::default()).unwrap();
        let q1 = build_priority_queue(&report(), &Config::default(), &store).unwrap();
        let q2 = build_priority_queue(&report(), &Config::default(), &store).unwrap();
        let paths1: Vec<_> = q1.iter().map(|i| &i.filepath).collect();
        let paths2: Vec<_> = q2.iter().map(|i| &i.filepath).collect();
        assert_eq!(paths1, paths2);
    }
}
