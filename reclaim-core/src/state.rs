//! The durable state store. A single JSON document at
//! `<staging>/pipeline_state.json`, guarded by one reentrant-in-spirit lock
//! held only across a read-modify-write of a single record plus the save
//! that follows it — matching the "atomic claim and transition write in one
//! critical section" rule the scheduler depends on.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::Config;
use crate::error::StageError;
use crate::model::{FileRecord, FileStatus, GlobalStats};

#[derive(Debug, Serialize, Deserialize)]
struct StateDoc {
    created: chrono::DateTime<chrono::Utc>,
    last_updated: Option<chrono::DateTime<chrono::Utc>>,
    config: Config,
    stats: GlobalStats,
    files: HashMap<String, FileRecord>,
}

pub struct StateStore {
    path: PathBuf,
    inner: Mutex<StateDoc>,
}

impl StateStore {
    /// Loads `path` if it exists, else starts a fresh document seeded with
    /// `config`. `config` is always written into a freshly-created store so
    /// the state file is a complete record of the run that produced it.
    pub fn load_or_create(path: &Path, config: Config) -> anyhow::Result<Self> {
        let doc = if path.exists() {
            let raw = fs::read_to_string(path)?;
            let doc: StateDoc = serde_json::from_str(&raw)?;
            info!(files = doc.files.len(), "loaded existing pipeline state");
            doc
        } else {
            StateDoc {
                created: now(),
                last_updated: None,
                config,
                stats: GlobalStats::default(),
                files: HashMap::new(),
            }
        };
        Ok(StateStore { path: path.to_path_buf(), inner: Mutex::new(doc) })
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let mut guard = self.inner.lock();
        guard.last_updated = Some(now());
        let serialized = serde_json::to_string_pretty(&*guard)?;
        drop(guard);

        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serialized)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    pub fn get_file(&self, filepath: &str) -> Option<FileRecord> {
        self.inner.lock().files.get(filepath).cloned()
    }

    /// Merges `update` into the record for `filepath` (creating it if
    /// absent), persists, and returns the merged record. Saving happens
    /// while still holding the lock's critical section logically (the save
    /// itself takes its own lock after the mutation is committed), matching
    /// the original's "save after every status change".
    pub fn set_file<F>(&self, filepath: &str, mutate: F) -> anyhow::Result<FileRecord>
    where
        F: FnOnce(&mut FileRecord),
    {
        {
            let mut guard = self.inner.lock();
            let record = guard
                .files
                .entry(filepath.to_string())
                .or_insert_with(|| FileRecord::new(now()));
            mutate(record);
            record.last_updated = now();
        }
        self.save()?;
        Ok(self.get_file(filepath).expect("just inserted"))
    }

    /// Atomically claims `filepath` for fetching: if it is already
    /// FETCHING, returns `Ok(false)` (another worker holds the claim) and
    /// does not persist; otherwise transitions to FETCHING and returns
    /// `Ok(true)`. The check and the write happen under the same lock so
    /// two racing prefetch passes cannot both observe PENDING.
    pub fn try_claim_fetching(&self, filepath: &str) -> anyhow::Result<bool> {
        let already_claimed = {
            let mut guard = self.inner.lock();
            let record = guard
                .files
                .entry(filepath.to_string())
                .or_insert_with(|| FileRecord::new(now()));
            if record.status == FileStatus::Fetching {
                true
            } else {
                record.status = FileStatus::Fetching;
                record.last_updated = now();
                false
            }
        };
        if already_claimed {
            Ok(false)
        } else {
            self.save()?;
            Ok(true)
        }
    }

    pub fn get_files_by_status(&self, status: FileStatus) -> Vec<String> {
        self.inner
            .lock()
            .files
            .iter()
            .filter(|(_, record)| record.status == status)
            .map(|(path, _)| path.clone())
            .collect()
    }

    pub fn stats(&self) -> GlobalStats {
        self.inner.lock().stats.clone()
    }

    pub fn update_stats<F>(&self, mutate: F) -> anyhow::Result<()>
    where
        F: FnOnce(&mut GlobalStats),
    {
        {
            let mut guard = self.inner.lock();
            mutate(&mut guard.stats);
        }
        self.save()
    }

    pub fn config(&self) -> Config {
        self.inner.lock().config.clone()
    }

    pub fn all_records(&self) -> HashMap<String, FileRecord> {
        self.inner.lock().files.clone()
    }

    /// Resets any FETCHING/ENCODING/UPLOADING record whose local artifact
    /// is missing back to PENDING. Not present in the pipeline this was
    /// modeled on — that implementation has no startup recovery pass at
    /// all — but required so a process killed mid-stage doesn't leave a
    /// record permanently stuck in an in-flight status with no worker able
    /// to claim it again.
    pub fn recover_zombies(&self) -> anyhow::Result<usize> {
        let candidates: Vec<(String, FileRecord)> = {
            let guard = self.inner.lock();
            guard
                .files
                .iter()
                .filter(|(_, r)| r.status.is_zombie_candidate())
                .map(|(p, r)| (p.clone(), r.clone()))
                .collect()
        };

        let mut reset = 0;
        for (filepath, record) in candidates {
            match record.status {
                FileStatus::Fetching => {
                    let missing = record
                        .local_input_path
                        .as_ref()
                        .map(|p| !Path::new(p).exists())
                        .unwrap_or(true);
                    if missing {
                        self.set_file(&filepath, |r| {
                            r.status = FileStatus::Pending;
                            r.reason = None;
                        })?;
                        reset += 1;
                        info!(filepath, "reset zombie status to pending");
                    }
                }
                // The encode stage consumes the fetched input and only removes
                // it once the encoded output is durably recorded (stages/encode.rs),
                // so a crash mid-encode always leaves the fetched input in place:
                // step back to FETCHED and let it re-encode, rather than refetching.
                FileStatus::Encoding => {
                    let input_present = record
                        .local_input_path
                        .as_ref()
                        .map(|p| Path::new(p).exists())
                        .unwrap_or(false);
                    if input_present {
                        self.set_file(&filepath, |r| {
                            r.status = FileStatus::Fetched;
                            r.reason = None;
                        })?;
                        reset += 1;
                        info!(filepath, "reset zombie status to fetched (input still staged)");
                    } else {
                        self.set_file(&filepath, |r| {
                            r.status = FileStatus::Pending;
                            r.reason = None;
                        })?;
                        reset += 1;
                        info!(filepath, "reset zombie status to pending");
                    }
                }
                // Mirrors the ENCODING case: the encoded output is only removed
                // once the upload is durably recorded (stages/upload.rs), so a
                // crash mid-upload always leaves it in place: step back to
                // ENCODED and let it re-upload, rather than re-encoding.
                FileStatus::Uploading => {
                    let output_present = record
                        .local_output_path
                        .as_ref()
                        .map(|p| Path::new(p).exists())
                        .unwrap_or(false);
                    if output_present {
                        self.set_file(&filepath, |r| {
                            r.status = FileStatus::Encoded;
                            r.reason = None;
                        })?;
                        reset += 1;
                        info!(filepath, "reset zombie status to encoded (output still staged)");
                    } else {
                        self.set_file(&filepath, |r| {
                            r.status = FileStatus::Pending;
                            r.reason = None;
                        })?;
                        reset += 1;
                        info!(filepath, "reset zombie status to pending");
                    }
                }
                _ => {}
            }
        }
        Ok(reset)
    }
}

fn now() -> chrono::DateTime<chrono::Utc> {
    chrono::Utc::now()
}

/// Turns a `StageError` into a durable ERROR transition on the given
/// record, matching the error-handling design's "stage recorded" rule.
pub fn record_error(store: &StateStore, filepath: &str, err: &StageError) -> anyhow::Result<()> {
    let stage = err.stage_name();
    let message = err.to_string();
    store.set_file(filepath, |r| {
        r.status = FileStatus::Error;
        r.last_error = Some(message);
        r.last_error_stage = Some(stage.to_string());
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn save_then_reload_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pipeline_state.json");
        let store = StateStore::load_or_create(&path, Config::default()).unwrap();
        store
            .set_file("/media/a.mkv", |r| r.status = FileStatus::Fetched)
            .unwrap();

        let reloaded = StateStore::load_or_create(&path, Config::default()).unwrap();
        let record = reloaded.get_file("/media/a.mkv").unwrap();
        assert_eq!(record.status, FileStatus::Fetched);
    }

    #[test]
    fn claim_fetching_is_exclusive() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pipeline_state.json");
        let store = StateStore::load_or_create(&path, Config::default()).unwrap();

        assert!(store.try_claim_fetching("/media/a.mkv").unwrap());
        assert!(!store.try_claim_fetching("/media/a.mkv").unwrap());
    }

    #[test]
    fn recover_zombies_resets_missing_artifacts() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pipeline_state.json");
        let store = StateStore::load_or_create(&path, Config::default()).unwrap();
        store
            .set_file("/media/a.mkv", |r| {
                r.status = FileStatus::Encoding;
                r.local_input_path = Some("/nonexistent/a.mkv".to_string());
            })
            .unwrap();

        let reset = store.recover_zombies().unwrap();
        assert_eq!(reset, 1);
        assert_eq!(store.get_file("/media/a.mkv").unwrap().status, FileStatus::Pending);
    }

    #[test]
    fn recover_zombies_steps_encoding_back_to_fetched_when_input_still_staged() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pipeline_state.json");
        let store = StateStore::load_or_create(&path, Config::default()).unwrap();
        let local = dir.path().join("a.mkv");
        fs::write(&local, b"x").unwrap();
        store
            .set_file("/media/a.mkv", |r| {
                r.status = FileStatus::Encoding;
                r.local_input_path = Some(local.to_string_lossy().to_string());
            })
            .unwrap();

        let reset = store.recover_zombies().unwrap();
        assert_eq!(reset, 1);
        assert_eq!(store.get_file("/media/a.mkv").unwrap().status, FileStatus::Fetched);
    }
}
