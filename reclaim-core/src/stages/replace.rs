use std::fs;
use std::path::{Path, PathBuf};

use tracing::{error, info};

use crate::error::StageError;
use crate::model::{FileStatus, WorkItem};
use crate::state::StateStore;

/// Crash-safe replacement: `S` = original source, `D` = uploaded `.av1.mkv`,
/// `F` = final target path (original stem + `.mkv`), `B` = `S + ".original.bak"`.
/// Every step is guarded by existence checks on both sides so invoking this
/// repeatedly from any partial-completion state converges on REPLACED
/// without ever losing the AV1 output.
pub fn stage_replace(item: &WorkItem, store: &StateStore) -> Result<PathBuf, StageError> {
    let record = store
        .get_file(&item.filepath)
        .ok_or_else(|| StageError::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "no record")))?;

    let source_path = Path::new(&item.filepath);
    let source_dir = source_path.parent().unwrap_or_else(|| Path::new("."));
    let final_stem = Path::new(&item.filename).file_stem().unwrap_or_default().to_string_lossy();
    let final_path = source_dir.join(format!("{final_stem}.mkv"));
    let backup_path = PathBuf::from(format!("{}.original.bak", item.filepath));

    let dest_path = record.destination_path.as_ref().map(PathBuf::from).filter(|p| p.exists());
    // Step 2 of the protocol renames D -> F, so a crash after that point
    // leaves D gone (it's now F) even though the replace hasn't finished
    // steps 3/4 yet. Accept F already existing as evidence the rename
    // already happened, rather than treating D's absence as an error.
    if dest_path.is_none() && !final_path.exists() {
        error!(filepath = %item.filepath, "av1 file missing for replace");
        store.set_file(&item.filepath, |r| {
            r.status = FileStatus::Error;
            r.last_error = Some("av1 file missing for replace".to_string());
            r.last_error_stage = Some("replace".to_string());
        })?;
        return Err(StageError::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "av1 file missing")));
    }
    let dest_path = dest_path.unwrap_or_else(|| final_path.clone());

    store.set_file(&item.filepath, |r| {
        r.status = FileStatus::Replacing;
        r.destination_path = Some(dest_path.to_string_lossy().to_string());
        r.final_path = Some(final_path.to_string_lossy().to_string());
        r.backup_path = Some(backup_path.to_string_lossy().to_string());
    })?;

    let run = || -> std::io::Result<()> {
        if source_path.exists() && !backup_path.exists() {
            fs::rename(source_path, &backup_path)?;
            info!(from = %source_path.display(), to = %backup_path.display(), "backed up original");
        }

        if dest_path.exists() && !final_path.exists() {
            fs::rename(&dest_path, &final_path)?;
            info!(to = %final_path.display(), "renamed av1 file into place");
        } else if dest_path.exists() && dest_path != final_path {
            // final_path already exists (e.g. a previous partial run); force
            // the overwrite rather than relying on rename's platform-specific
            // destination-exists behavior.
            let _ = fs::remove_file(&final_path);
            fs::rename(&dest_path, &final_path)?;
        }

        if backup_path.exists() {
            fs::remove_file(&backup_path)?;
            info!("deleted original backup");
        }
        Ok(())
    };

    match run() {
        Ok(()) => {
            store.set_file(&item.filepath, |r| {
                r.status = FileStatus::Replaced;
                r.final_path = Some(final_path.to_string_lossy().to_string());
            })?;
            info!(filename = %item.filename, target = %final_path.display(), "replaced");
            Ok(final_path)
        }
        Err(e) => {
            error!(
                backup = %backup_path.display(),
                av1 = %dest_path.display(),
                target = %final_path.display(),
                error = %e,
                "replace failed, manual recovery may be needed"
            );
            store.set_file(&item.filepath, |r| {
                r.status = FileStatus::Error;
                r.last_error = Some(e.to_string());
                r.last_error_stage = Some("replace".to_string());
            })?;
            Err(StageError::ReplaceFailed { step: "rename-sequence", detail: e.to_string() })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::model::{AudioStream, LibraryType};
    use tempfile::tempdir;

    fn item(filepath: &str, filename: &str) -> WorkItem {
        WorkItem {
            filepath: filepath.to_string(),
            filename: filename.to_string(),
            file_size_bytes: 1,
            file_size_gb: 0.0,
            duration_seconds: 0.0,
            bitrate_kbps: 0.0,
            video_codec: "HEVC (H.265)".into(),
            video_codec_raw: "hevc".into(),
            resolution_class: "1080p".into(),
            hdr: false,
            bit_depth: 8,
            audio_streams: Vec::<AudioStream>::new(),
            subtitle_count: 0,
            library_type: LibraryType::Movie,
            priority_tier: 0,
            tier_name: "x".into(),
        }
    }

    #[test]
    fn scenario_3_resumes_after_crash_between_step_1_and_2() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("Movie.mkv");
        let dest = dir.path().join("Movie.av1.mkv");
        let backup = PathBuf::from(format!("{}.original.bak", source.to_string_lossy()));
        let final_path = dir.path().join("Movie.mkv");

        // Simulate crash right after step 1: source already renamed to backup,
        // dest (the av1 upload) still present, final path absent.
        fs::write(&backup, b"original bytes").unwrap();
        fs::write(&dest, b"av1 bytes").unwrap();

        let store = StateStore::load_or_create(&dir.path().join("state.json"), Config::default()).unwrap();
        let it = item(source.to_string_lossy().as_ref(), "Movie.mkv");
        store
            .set_file(&it.filepath, |r| {
                r.status = FileStatus::Replacing;
                r.destination_path = Some(dest.to_string_lossy().to_string());
            })
            .unwrap();

        let result = stage_replace(&it, &store).unwrap();
        assert_eq!(result, final_path);
        assert!(!backup.exists());
        assert!(final_path.exists());
        assert_eq!(fs::read(&final_path).unwrap(), b"av1 bytes");
    }

    #[test]
    fn resumes_after_crash_between_step_2_and_3() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("Movie.mkv");
        let dest = dir.path().join("Movie.av1.mkv");
        let backup = PathBuf::from(format!("{}.original.bak", source.to_string_lossy()));
        let final_path = dir.path().join("Movie.mkv");

        // Simulate crash right after step 2: source already backed up, D
        // already renamed to F, so dest no longer exists at its recorded
        // path and only the backup remains to be cleaned up.
        fs::write(&backup, b"original bytes").unwrap();
        fs::write(&final_path, b"av1 bytes").unwrap();

        let store = StateStore::load_or_create(&dir.path().join("state.json"), Config::default()).unwrap();
        let it = item(source.to_string_lossy().as_ref(), "Movie.mkv");
        store
            .set_file(&it.filepath, |r| {
                r.status = FileStatus::Replacing;
                r.destination_path = Some(dest.to_string_lossy().to_string());
            })
            .unwrap();

        let result = stage_replace(&it, &store).unwrap();
        assert_eq!(result, final_path);
        assert!(!backup.exists());
        assert!(final_path.exists());
        assert_eq!(fs::read(&final_path).unwrap(), b"av1 bytes");
        assert_eq!(store.get_file(&it.filepath).unwrap().status, FileStatus::Replaced);
    }

    #[test]
    fn replace_is_idempotent_when_rerun_after_full_completion() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("Movie.mkv");
        let dest = dir.path().join("Movie.av1.mkv");
        fs::write(&source, b"original").unwrap();
        fs::write(&dest, b"av1").unwrap();

        let store = StateStore::load_or_create(&dir.path().join("state.json"), Config::default()).unwrap();
        let it = item(source.to_string_lossy().as_ref(), "Movie.mkv");
        store
            .set_file(&it.filepath, |r| {
                r.status = FileStatus::Replacing;
                r.destination_path = Some(dest.to_string_lossy().to_string());
            })
            .unwrap();

        let final_path = stage_replace(&it, &store).unwrap();
        let second = stage_replace(&it, &store).unwrap();
        assert_eq!(final_path, second);
        assert!(final_path.exists());
    }
}
