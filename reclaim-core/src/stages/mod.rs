//! The five stage workers. Each takes the source path, the `WorkItem`, the
//! staging directory, the effective configuration, and the `StateStore`,
//! and returns success/failure, updating the `FileRecord` on every path
//! before returning. No stage mutates anything outside the Store and the
//! filesystem region it owns.

mod encode;
mod fetch;
mod replace;
mod upload;
mod verify;

pub use encode::stage_encode;
pub use fetch::stage_fetch;
pub use replace::stage_replace;
pub use upload::stage_upload;
pub use verify::stage_verify;

use std::fs;
use std::path::Path;

/// Total bytes currently occupied under `staging_dir` (fetch + encoded
/// subdirectories and anything else left there).
pub fn get_staging_usage(staging_dir: &Path) -> u64 {
    walk_size(staging_dir)
}

pub fn get_fetch_buffer_usage(staging_dir: &Path) -> u64 {
    walk_size(&staging_dir.join("fetch"))
}

fn walk_size(dir: &Path) -> u64 {
    let Ok(entries) = fs::read_dir(dir) else { return 0 };
    let mut total = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            total += walk_size(&path);
        } else if let Ok(meta) = entry.metadata() {
            total += meta.len();
        }
    }
    total
}

/// Free space on the drive backing `path`, via `sysinfo`'s disk listing —
/// matches the teacher's choice of `sysinfo` for host resource queries.
pub fn get_free_space(path: &Path) -> u64 {
    use sysinfo::{DiskExt, System, SystemExt};

    let mut system = System::new();
    system.refresh_disks_list();

    let target = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    let mut best: Option<(&std::path::Path, u64)> = None;
    for disk in system.disks() {
        let mount = disk.mount_point();
        if target.starts_with(mount) {
            let depth = mount.components().count();
            if best.map(|(m, _)| depth > m.components().count()).unwrap_or(true) {
                best = Some((mount, disk.available_space()));
            }
        }
    }
    best.map(|(_, free)| free).unwrap_or(u64::MAX)
}
