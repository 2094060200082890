//! The main loop: selects the next ready item, drives it through the
//! remaining stages, interleaves control-channel checks, and prints
//! periodic progress until the queue is exhausted or shutdown is signaled.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::config::Config;
use crate::control::ControlChannel;
use crate::model::{FileStatus, WorkItem};
use crate::prefetch;
use crate::stages::{get_staging_usage, stage_encode, stage_fetch, stage_replace, stage_upload, stage_verify};
use crate::state::StateStore;
use crate::util::{format_bytes, format_duration};

const PROGRESS_EVERY: usize = 5;

pub struct Orchestrator {
    config: Config,
    staging_dir: PathBuf,
    control: ControlChannel,
    store: StateStore,
    shutdown: Arc<AtomicBool>,
}

impl Orchestrator {
    pub fn new(config: Config, staging_dir: &Path, store: StateStore, shutdown: Arc<AtomicBool>) -> anyhow::Result<Self> {
        let control = ControlChannel::new(staging_dir)?;
        Ok(Orchestrator { config, staging_dir: staging_dir.to_path_buf(), control, store, shutdown })
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Runs the full queue to completion (or shutdown). `report_index` maps
    /// filepath → WorkItem for every entry in the original report, used to
    /// build a WorkItem when a priority path is injected that isn't in the
    /// queue yet.
    pub fn run(&self, mut queue: Vec<WorkItem>, report_index: &[WorkItem], dry_run: bool) -> anyhow::Result<()> {
        info!(files = queue.len(), "pipeline starting");
        info!(staging = %self.staging_dir.display(), limit = %format_bytes(self.config.max_staging_bytes), "staging configuration");
        info!(replace_originals = self.config.replace_original, "");

        if dry_run {
            self.print_dry_run(&queue);
            return Ok(());
        }

        std::fs::create_dir_all(self.staging_dir.join("fetch"))?;
        std::fs::create_dir_all(self.staging_dir.join("encoded"))?;

        queue = self.control.apply_queue_overrides(queue, |i| i.filepath.as_str());

        let prefetch_shutdown = self.shutdown.clone();
        let prefetch_queue = queue.clone();
        let prefetch_staging = self.staging_dir.clone();
        let prefetch_config = self.config.clone();
        // The prefetch worker only reads the store and control channel
        // through their own internal locking, so sharing by reference
        // across the thread boundary is safe via a scoped thread.
        let store_ref = &self.store;
        let control_ref = &self.control;

        std::thread::scope(|scope| {
            let prefetch_handle = scope.spawn(move || {
                prefetch::run(&prefetch_queue, &prefetch_staging, &prefetch_config, control_ref, store_ref, prefetch_shutdown);
            });

            let mut processed = 0usize;
            let mut was_interrupted = false;

            loop {
                if self.is_shutdown() {
                    was_interrupted = true;
                    break;
                }

                self.control.check_pause(|| self.is_shutdown());
                if self.is_shutdown() {
                    was_interrupted = true;
                    break;
                }

                if processed > 0 && processed % PROGRESS_EVERY == 0 {
                    self.print_progress(&queue, processed);
                    queue = self.control.apply_queue_overrides(std::mem::take(&mut queue), |i| i.filepath.as_str());
                }

                self.inject_priority_paths(&mut queue, report_index);

                let selection = self.select_ready_item(&queue, !prefetch_handle.is_finished());
                let Some(item) = selection else { break };

                if self.control.should_skip(&item.filepath) {
                    info!(filename = %item.filename, "skipped (control)");
                    let _ = self.store.set_file(&item.filepath, |r| {
                        r.status = FileStatus::Skipped;
                        r.reason = Some("control skip".to_string());
                    });
                    continue;
                }

                processed += 1;
                info!(n = processed, total = queue.len(), tier = %item.tier_name, filename = %item.filename, "processing");

                let prefetch_active = !prefetch_handle.is_finished();
                let success = self.process_item(&item, prefetch_active);
                if !success && !self.is_shutdown() {
                    let _ = self.store.update_stats(|s| s.errors += 1);
                }
            }

            self.shutdown.store(true, Ordering::SeqCst);
            let _ = prefetch_handle.join();

            self.print_progress(&queue, processed);
            if was_interrupted {
                info!("pipeline paused — run again to resume");
            } else {
                info!("pipeline finished");
            }
        });

        Ok(())
    }

    /// Drives one item through encode → upload → verify → replace,
    /// fetching inline first when it reaches here still PENDING (resume
    /// fallback or freshly-injected priority item).
    fn process_item(&self, item: &WorkItem, prefetch_active: bool) -> bool {
        let mut current_status = self.store.get_file(&item.filepath).map(|r| r.status);

        self.recover_zombie(&item.filepath);
        current_status = self.store.get_file(&item.filepath).map(|r| r.status);

        if !prefetch_active && matches!(current_status, None | Some(FileStatus::Pending)) {
            if stage_fetch(item, &self.staging_dir, &self.config, &self.store).is_err() {
                return false;
            }
            current_status = self.store.get_file(&item.filepath).map(|r| r.status);
        }

        if self.is_shutdown() {
            return false;
        }

        if matches!(current_status, Some(FileStatus::Fetched) | Some(FileStatus::Fetching)) {
            if stage_encode(item, &self.staging_dir, &self.config, &self.control, &self.store).is_err() {
                return false;
            }
            current_status = self.store.get_file(&item.filepath).map(|r| r.status);
        }

        if self.is_shutdown() {
            return false;
        }

        if matches!(current_status, Some(FileStatus::Encoded)) {
            if stage_upload(item, &self.config, &self.store).is_err() {
                return false;
            }
            current_status = self.store.get_file(&item.filepath).map(|r| r.status);
        }

        if self.is_shutdown() {
            return false;
        }

        if matches!(current_status, Some(FileStatus::Uploaded)) {
            if stage_verify(item, &self.config, &self.store).is_err() {
                return false;
            }
            current_status = self.store.get_file(&item.filepath).map(|r| r.status);
        }

        if self.is_shutdown() {
            return false;
        }

        if matches!(current_status, Some(FileStatus::Verified)) && self.config.replace_original {
            return stage_replace(item, &self.store).is_ok();
        }

        if matches!(current_status, Some(FileStatus::Replacing)) {
            return stage_replace(item, &self.store).is_ok();
        }

        matches!(current_status, Some(FileStatus::Verified) | Some(FileStatus::Replaced))
    }

    /// Resets a mid-flight status when its required local artifact is
    /// absent, so a process killed between stages doesn't strand the item in
    /// a status nothing can advance from. ENCODING is special-cased: the
    /// encode stage only removes the fetched input after the encoded output
    /// is durably recorded, so a crash mid-encode leaves the input staged —
    /// step back to FETCHED and re-encode rather than refetching from scratch.
    fn recover_zombie(&self, filepath: &str) {
        let Some(record) = self.store.get_file(filepath) else { return };
        if !record.status.is_zombie_candidate() {
            return;
        }

        if record.status == FileStatus::Encoding {
            let input_present = record.local_input_path.as_ref().map(|p| Path::new(p).exists()).unwrap_or(false);
            if input_present {
                let _ = self.store.set_file(filepath, |r| r.status = FileStatus::Fetched);
                info!(filepath, "reset zombie status to fetched (input still staged)");
            } else {
                let _ = self.store.set_file(filepath, |r| r.status = FileStatus::Pending);
                info!(filepath, "reset zombie status to pending");
            }
            return;
        }

        // Mirrors the ENCODING case: the encoded output is only removed once
        // the upload is durably recorded (stages/upload.rs), so a crash
        // mid-upload always leaves it in place: step back to ENCODED and let
        // it re-upload, rather than re-encoding.
        if record.status == FileStatus::Uploading {
            let output_present = record.local_output_path.as_ref().map(|p| Path::new(p).exists()).unwrap_or(false);
            if output_present {
                let _ = self.store.set_file(filepath, |r| r.status = FileStatus::Encoded);
                info!(filepath, "reset zombie status to encoded (output still staged)");
            } else {
                let _ = self.store.set_file(filepath, |r| r.status = FileStatus::Pending);
                info!(filepath, "reset zombie status to pending");
            }
            return;
        }

        let artifact = match record.status {
            FileStatus::Fetching => record.local_input_path.clone(),
            _ => record.local_output_path.clone(),
        };
        let missing = artifact.map(|p| !Path::new(&p).exists()).unwrap_or(true);
        if missing {
            let _ = self.store.set_file(filepath, |r| r.status = FileStatus::Pending);
            info!(filepath, "reset zombie status to pending");
        }
    }

    fn select_ready_item(&self, queue: &[WorkItem], prefetch_alive: bool) -> Option<WorkItem> {
        let mut first_pending: Option<&WorkItem> = None;
        let priority_paths = self.control.get_priority_bumps();

        for item in queue {
            let status = self.store.get_file(&item.filepath).map(|r| r.status);
            if matches!(status, Some(s) if s.is_terminal()) {
                continue;
            }
            if matches!(status, Some(s) if s.is_ready_to_advance()) {
                return Some(item.clone());
            }
            if matches!(status, None | Some(FileStatus::Pending)) {
                let is_priority = priority_paths.iter().any(|p| crate::util::paths_equal(p, &item.filepath));
                if is_priority {
                    return Some(item.clone());
                }
                if first_pending.is_none() {
                    first_pending = Some(item);
                }
            }
        }

        if let Some(item) = first_pending {
            return Some(item.clone());
        }

        if prefetch_alive {
            std::thread::sleep(Duration::from_secs(5));
        }
        None
    }

    /// Looks up newly-added priority paths that aren't in the queue yet but
    /// exist in the original report, and prepends them. A path already
    /// present in the queue (case-insensitive) is a no-op, per the
    /// prescribed resolution of the double-schedule open question.
    fn inject_priority_paths(&self, queue: &mut Vec<WorkItem>, report_index: &[WorkItem]) {
        let bumps = self.control.get_priority_bumps();
        for path in bumps {
            let already_queued = queue.iter().any(|i| crate::util::paths_equal(&i.filepath, &path));
            if already_queued {
                continue;
            }
            if let Some(item) = report_index.iter().find(|i| crate::util::paths_equal(&i.filepath, &path)) {
                info!(filepath = %path, "priority path injected into queue");
                queue.insert(0, item.clone());
            }
        }
    }

    fn print_dry_run(&self, queue: &[WorkItem]) {
        let total_size: i64 = queue.iter().map(|i| i.file_size_bytes).sum();
        info!(count = queue.len(), size = %format_bytes(total_size), "dry run — no files will be modified");
        for (i, item) in queue.iter().take(30).enumerate() {
            let params = self.config.resolve_encode_params(item);
            info!(
                n = i + 1,
                tier = %item.tier_name,
                filename = %item.filename,
                size = %format_bytes(item.file_size_bytes),
                codec = %item.video_codec,
                resolution = %item.resolution_class,
                cq = params.cq,
                preset = %params.preset,
                "would process"
            );
        }
        if queue.len() > 30 {
            info!(more = queue.len() - 30, "additional files not shown");
        }
    }

    fn print_progress(&self, queue: &[WorkItem], processed: usize) {
        let stats = self.store.stats();
        let total = queue.len();
        let avg_time = if stats.completed > 0 { stats.total_encode_time_secs / stats.completed as f64 } else { 0.0 };
        let eta = self.format_eta_tier_aware(queue);
        let replaced = self.store.get_files_by_status(FileStatus::Replaced).len();

        info!("{}", "=".repeat(70));
        if total > 0 {
            info!(
                "Progress: {}/{} files ({:.1}%)",
                stats.completed,
                total,
                100.0 * stats.completed as f64 / total as f64
            );
        }
        info!("Replaced: {replaced} originals");
        info!("Saved:    {}", format_bytes(stats.bytes_saved));
        info!("Errors:   {}", stats.errors);
        info!("Avg encode time: {}", format_duration(avg_time));
        info!("ETA:      {eta}");

        let mut tiers: Vec<_> = stats.tier_stats.iter().collect();
        tiers.sort_by_key(|(k, _)| k.clone());
        for (res_key, tier) in tiers {
            let t_avg = if tier.completed > 0 { tier.total_encode_time_secs / tier.completed as f64 } else { 0.0 };
            let t_speed = if tier.total_encode_time_secs > 0.0 {
                tier.total_input_bytes as f64 / tier.total_encode_time_secs / (1024.0 * 1024.0)
            } else {
                0.0
            };
            info!(
                "  {res_key:>8}: {} done, {} saved, avg {}/file, {t_speed:.1} MB/s",
                tier.completed,
                format_bytes(tier.bytes_saved),
                format_duration(t_avg),
            );
        }

        info!("Staging:  {}", format_bytes(get_staging_usage(&self.staging_dir) as i64));
        info!("{}", "=".repeat(70));
        let _ = processed;
    }

    fn format_eta_tier_aware(&self, queue: &[WorkItem]) -> String {
        let stats = self.store.stats();
        let overall_avg = if stats.completed > 0 { stats.total_encode_time_secs / stats.completed as f64 } else { 0.0 };
        if overall_avg <= 0.0 {
            return "unknown".to_string();
        }

        let mut total_secs = 0.0;
        let mut remaining = 0;
        for item in queue {
            let status = self.store.get_file(&item.filepath).map(|r| r.status);
            if matches!(status, Some(s) if s.is_terminal()) {
                continue;
            }
            remaining += 1;
            let res_key = item.res_key();
            let per_file = stats
                .tier_stats
                .get(&res_key)
                .filter(|t| t.completed >= 2 && t.total_encode_time_secs > 0.0)
                .map(|t| t.total_encode_time_secs / t.completed as f64)
                .unwrap_or(overall_avg);
            total_secs += per_file;
        }

        if remaining == 0 {
            "done".to_string()
        } else {
            format_duration(total_secs)
        }
    }
}
