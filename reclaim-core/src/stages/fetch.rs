use std::fs;
use std::path::PathBuf;
use std::time::Instant;

use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::StageError;
use crate::model::{FileStatus, WorkItem};
use crate::state::StateStore;
use crate::util::{format_bytes, format_duration, hash_path};

use super::{get_fetch_buffer_usage, get_free_space, get_staging_usage};

/// Copies the source file into `<staging>/fetch/`. Pre-flight budget gates
/// return `Err` with a retriable variant the caller should back off on
/// rather than treat as a failed file. Returns the local path on success.
pub fn stage_fetch(
    item: &WorkItem,
    staging_dir: &std::path::Path,
    config: &Config,
    store: &StateStore,
) -> Result<PathBuf, StageError> {
    let source = std::path::Path::new(&item.filepath);
    let fetch_dir = staging_dir.join("fetch");
    fs::create_dir_all(&fetch_dir)?;

    let safe_name = format!("{}_{}", hash_path(&item.filepath), item.filename);
    let local_path = fetch_dir.join(&safe_name);

    let current_usage = get_staging_usage(staging_dir);
    if current_usage + item.file_size_bytes as u64 > config.max_staging_bytes as u64 {
        warn!(used = %format_bytes(current_usage as i64), "staging full, waiting");
        return Err(StageError::StagingBudgetExceeded);
    }

    let free = get_free_space(staging_dir);
    if free < config.min_free_space_bytes as u64 + item.file_size_bytes as u64 {
        warn!(free = %format_bytes(free as i64), "insufficient free space, waiting");
        return Err(StageError::FreeSpaceFloor);
    }

    let fetch_usage = get_fetch_buffer_usage(staging_dir);
    if fetch_usage + item.file_size_bytes as u64 > config.max_fetch_buffer_bytes as u64 {
        info!(used = %format_bytes(fetch_usage as i64), "fetch buffer full, waiting for encodes to drain");
        return Err(StageError::FetchBufferExceeded);
    }

    if !source.exists() {
        warn!(filename = %item.filename, "source file not found, skipping");
        store.set_file(&item.filepath, |r| {
            r.status = FileStatus::Skipped;
            r.reason = Some("source file not found".to_string());
        })?;
        return Err(StageError::SourceNotFound(item.filepath.clone()));
    }

    if !store.try_claim_fetching(&item.filepath)? {
        // another worker already holds the claim; not an error, just a no-op
        return Err(StageError::FetchBufferExceeded);
    }
    store.set_file(&item.filepath, |r| r.local_input_path = Some(local_path.to_string_lossy().to_string()))?;

    info!(filename = %item.filename, size = %format_bytes(item.file_size_bytes), "fetching");

    let start = Instant::now();
    let copy_result = fs::copy(source, &local_path);
    match copy_result {
        Ok(_) => {
            let elapsed = start.elapsed().as_secs_f64();
            let speed_mbs = if elapsed > 0.0 {
                item.file_size_bytes as f64 / elapsed / (1024.0 * 1024.0)
            } else {
                0.0
            };
            info!(elapsed = %format_duration(elapsed), speed_mbs = %format!("{speed_mbs:.0}"), "fetched");
            store.set_file(&item.filepath, |r| {
                r.status = FileStatus::Fetched;
                r.local_input_path = Some(local_path.to_string_lossy().to_string());
            })?;
            Ok(local_path)
        }
        Err(e) => {
            error!(error = %e, "fetch failed");
            store.set_file(&item.filepath, |r| {
                r.status = FileStatus::Error;
                r.last_error = Some(e.to_string());
                r.last_error_stage = Some("fetch".to_string());
            })?;
            let _ = fs::remove_file(&local_path);
            Err(StageError::Io(e))
        }
    }
}
