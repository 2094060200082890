use std::fs;
use std::path::PathBuf;

use tracing::{error, info};

use crate::config::Config;
use crate::error::StageError;
use crate::ffmpeg::get_duration;
use crate::model::{FileStatus, TierStats, WorkItem};
use crate::state::StateStore;
use crate::util::format_bytes;

/// Probes the uploaded destination's duration against the source's recorded
/// duration; within tolerance records size/bytes-saved and updates both the
/// global and per-resolution-class stats blocks.
pub fn stage_verify(item: &WorkItem, config: &Config, store: &StateStore) -> Result<(), StageError> {
    let record = store
        .get_file(&item.filepath)
        .ok_or_else(|| StageError::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "no record")))?;

    let dest_path = record
        .destination_path
        .as_ref()
        .map(PathBuf::from)
        .filter(|p| p.exists());
    let Some(dest_path) = dest_path else {
        error!(filepath = %item.filepath, "destination file missing at verify stage");
        store.set_file(&item.filepath, |r| {
            r.status = FileStatus::Error;
            r.last_error = Some("dest file missing after upload".to_string());
            r.last_error_stage = Some("verify".to_string());
        })?;
        return Err(StageError::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "dest file missing")));
    };

    let dest_duration = get_duration(&dest_path).unwrap_or(0.0);
    if item.duration_seconds > 0.0 && (item.duration_seconds - dest_duration).abs() > config.verify_duration_tolerance_secs {
        error!(source = item.duration_seconds, dest = dest_duration, "verification failed: duration mismatch");
        store.set_file(&item.filepath, |r| {
            r.status = FileStatus::Error;
            r.last_error = Some("duration mismatch".to_string());
            r.last_error_stage = Some("verify".to_string());
        })?;
        return Err(StageError::DurationMismatch {
            source_secs: item.duration_seconds,
            output_secs: dest_duration,
            tolerance: config.verify_duration_tolerance_secs,
        });
    }

    let dest_size = fs::metadata(&dest_path)?.len() as i64;
    let saved = item.file_size_bytes - dest_size;
    let encode_time = record.encode_time_secs.unwrap_or(0.0);
    let res_key = item.res_key();

    store.set_file(&item.filepath, |r| {
        r.status = FileStatus::Verified;
        r.output_size_bytes = Some(dest_size);
        r.bytes_saved = Some(saved);
    })?;

    store.update_stats(|stats| {
        stats.completed += 1;
        stats.bytes_saved += saved;
        let tier = stats.tier_stats.entry(res_key).or_insert_with(TierStats::default);
        tier.completed += 1;
        tier.bytes_saved += saved;
        tier.total_input_bytes += item.file_size_bytes;
        tier.total_output_bytes += dest_size;
        tier.total_encode_time_secs += encode_time;
    })?;

    info!(filename = %item.filename, saved = %format_bytes(saved), "verified");
    Ok(())
}
