use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::StageError;
use crate::model::{FileStatus, WorkItem};
use crate::state::StateStore;
use crate::util::{format_bytes, format_duration};

/// Copies the encoded file back alongside the source with an
/// `.av1.mkv` suffix. If the destination already exists and overwrite is
/// disabled, skips (cleaning the local encoded file) rather than failing.
pub fn stage_upload(
    item: &WorkItem,
    config: &Config,
    store: &StateStore,
) -> Result<(), StageError> {
    let record = store
        .get_file(&item.filepath)
        .ok_or_else(|| StageError::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "no record")))?;

    let output_path = record
        .local_output_path
        .as_ref()
        .map(PathBuf::from)
        .filter(|p| p.exists());
    let Some(output_path) = output_path else {
        error!(filepath = %item.filepath, "encoded file missing at upload stage");
        store.set_file(&item.filepath, |r| {
            r.status = FileStatus::Error;
            r.last_error = Some("encoded file missing".to_string());
            r.last_error_stage = Some("upload".to_string());
        })?;
        return Err(StageError::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "encoded file missing")));
    };

    let source_dir = Path::new(&item.filepath).parent().unwrap_or_else(|| Path::new("."));
    let original_stem = Path::new(&item.filename).file_stem().unwrap_or_default().to_string_lossy();
    let dest_path = source_dir.join(format!("{original_stem}.av1.mkv"));

    if dest_path.exists() && !config.overwrite_existing {
        warn!(dest = %dest_path.display(), "destination exists, skipping");
        store.set_file(&item.filepath, |r| {
            r.status = FileStatus::Skipped;
            r.reason = Some("destination exists".to_string());
            r.destination_path = Some(dest_path.to_string_lossy().to_string());
        })?;
        let _ = fs::remove_file(&output_path);
        return Err(StageError::DestinationExists);
    }

    store.set_file(&item.filepath, |r| {
        r.status = FileStatus::Uploading;
        r.destination_path = Some(dest_path.to_string_lossy().to_string());
    })?;
    info!(dest = %dest_path.display(), "uploading");

    let start = Instant::now();
    match fs::copy(&output_path, &dest_path) {
        Ok(output_size) => {
            let elapsed = start.elapsed().as_secs_f64();
            let speed_mbs = if elapsed > 0.0 { output_size as f64 / elapsed / (1024.0 * 1024.0) } else { 0.0 };
            info!(elapsed = %format_duration(elapsed), speed_mbs = %format!("{speed_mbs:.0}"), "uploaded");

            store.set_file(&item.filepath, |r| r.status = FileStatus::Uploaded)?;
            fs::remove_file(&output_path)?;
            info!(freed = %format_bytes(output_size as i64), "cleaned up local encoded file");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "upload failed");
            store.set_file(&item.filepath, |r| {
                r.status = FileStatus::Error;
                r.last_error = Some(e.to_string());
                r.last_error_stage = Some("upload".to_string());
            })?;
            Err(StageError::Io(e))
        }
    }
}
