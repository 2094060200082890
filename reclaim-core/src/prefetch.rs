//! The prefetch worker: a background loop that advances items from
//! PENDING to FETCHED opportunistically, bounded by the staging and fetch
//! buffer budgets, so encode and network I/O overlap.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::config::Config;
use crate::control::ControlChannel;
use crate::error::StageError;
use crate::model::{FileStatus, WorkItem};
use crate::stages::stage_fetch;
use crate::state::StateStore;

const RETRY_BACKOFF: Duration = Duration::from_secs(10);
const MAX_RETRIES: u32 = 60;
const IDLE_PASS_WAIT: Duration = Duration::from_secs(30);

/// Runs until `shutdown` is observed true. Intended to be spawned on its
/// own thread; `queue` is a live, shared snapshot the orchestrator also
/// mutates, so reads here are always against the latest item statuses.
pub fn run(
    queue: &[WorkItem],
    staging_dir: &Path,
    config: &Config,
    control: &ControlChannel,
    store: &StateStore,
    shutdown: Arc<AtomicBool>,
) {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            return;
        }

        let mut fetched_any = false;

        for item in queue {
            if shutdown.load(Ordering::SeqCst) {
                return;
            }

            if control.should_skip(&item.filepath) {
                continue;
            }

            let status = store.get_file(&item.filepath).map(|r| r.status);
            if !matches!(status, None | Some(FileStatus::Pending)) {
                continue;
            }

            while control.is_fetch_paused() {
                if shutdown.load(Ordering::SeqCst) {
                    return;
                }
                std::thread::sleep(Duration::from_secs(5));
            }

            if fetch_with_retry(item, staging_dir, config, store, &shutdown) {
                fetched_any = true;
            }
        }

        if !fetched_any {
            sleep_or_shutdown(IDLE_PASS_WAIT, &shutdown);
        }
    }
}

/// Retries a transient budget/space failure up to `MAX_RETRIES` times with
/// a fixed backoff, giving encodes time to drain the fetch buffer. Gives up
/// with a warning rather than blocking the prefetch loop forever on one item.
fn fetch_with_retry(
    item: &WorkItem,
    staging_dir: &Path,
    config: &Config,
    store: &StateStore,
    shutdown: &Arc<AtomicBool>,
) -> bool {
    for attempt in 0..MAX_RETRIES {
        if shutdown.load(Ordering::SeqCst) {
            return false;
        }
        match stage_fetch(item, staging_dir, config, store) {
            Ok(_) => return true,
            Err(e) if matches!(e, StageError::SourceNotFound(_)) => return false,
            Err(e) if e.is_retriable() => {
                if attempt + 1 == MAX_RETRIES {
                    warn!(filename = %item.filename, "giving up fetching after max retries");
                    return false;
                }
                sleep_or_shutdown(RETRY_BACKOFF, shutdown);
            }
            Err(_) => return false,
        }
    }
    false
}

fn sleep_or_shutdown(duration: Duration, shutdown: &Arc<AtomicBool>) {
    let step = Duration::from_millis(500);
    let mut waited = Duration::ZERO;
    while waited < duration {
        if shutdown.load(Ordering::SeqCst) {
            return;
        }
        std::thread::sleep(step.min(duration - waited));
        waited += step;
    }
}
