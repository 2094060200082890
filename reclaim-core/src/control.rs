//! File-based control channel. A directory of small JSON documents an
//! operator edits in place to pause the pipeline, skip files, bump
//! priority, or tune per-file encode parameters — read on demand, with
//! each document's mtime cached so an unmodified file is never re-parsed.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::util::paths_equal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseType {
    All,
    FetchOnly,
    EncodeOnly,
}

impl PauseType {
    fn from_str(s: &str) -> PauseType {
        match s {
            "fetch_only" => PauseType::FetchOnly,
            "encode_only" => PauseType::EncodeOnly,
            _ => PauseType::All,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GentleOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cq_offset: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cq: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preset: Option<String>,
}

impl GentleOverride {
    /// Resolved per the open question in the design notes: an absolute
    /// `cq` wins over a relative `cq_offset` when both are present.
    pub fn apply_cq(&self, base_cq: i32) -> i32 {
        if let Some(cq) = self.cq {
            cq
        } else if let Some(offset) = self.cq_offset {
            (base_cq + offset).max(1)
        } else {
            base_cq
        }
    }
}

struct CachedFile {
    mtime: SystemTime,
    data: Value,
}

pub struct ControlChannel {
    control_dir: PathBuf,
    staging_dir: PathBuf,
    cache: Mutex<HashMap<PathBuf, CachedFile>>,
}

const ALIASES: &[(&str, &str, &str)] = &[
    ("pause_all.json", "pause.json", "all"),
    ("pause_fetch.json", "pause.json", "fetch_only"),
    ("pause_encode.json", "pause.json", "encode_only"),
];

impl ControlChannel {
    pub fn new(staging_dir: &Path) -> anyhow::Result<Self> {
        let control_dir = staging_dir.join("control");
        fs::create_dir_all(&control_dir)?;
        let channel = ControlChannel {
            control_dir,
            staging_dir: staging_dir.to_path_buf(),
            cache: Mutex::new(HashMap::new()),
        };
        channel.seed_persistent_files()?;
        Ok(channel)
    }

    fn seed_persistent_files(&self) -> anyhow::Result<()> {
        let defaults: &[(&str, Value)] = &[
            (
                "gentle.json",
                serde_json::json!({"paths": {}, "patterns": {}, "default_offset": 0}),
            ),
            ("skip.json", serde_json::json!({"paths": []})),
            ("priority.json", serde_json::json!({"paths": []})),
        ];
        for (name, default) in defaults {
            let path = self.control_dir.join(name);
            if !path.exists() {
                fs::write(&path, serde_json::to_string_pretty(default)?)?;
                info!(file = %name, "created control file with empty defaults");
            }
        }
        Ok(())
    }

    fn find_control_file(&self, canonical_name: &str) -> Option<(PathBuf, Value)> {
        let canonical_path = self.control_dir.join(canonical_name);
        if canonical_path.exists() {
            return Some((canonical_path, Value::Object(Default::default())));
        }
        for (alias, canon, implied_type) in ALIASES {
            if *canon != canonical_name {
                continue;
            }
            let alias_path = self.control_dir.join(alias);
            if alias_path.exists() {
                return Some((alias_path, serde_json::json!({"type": implied_type})));
            }
        }
        None
    }

    fn read_control_file(&self, canonical_name: &str) -> Option<Value> {
        let (path, implicit) = self.find_control_file(canonical_name)?;
        let mtime = fs::metadata(&path).and_then(|m| m.modified()).ok()?;

        {
            let cache = self.cache.lock();
            if let Some(cached) = cache.get(&path) {
                if cached.mtime == mtime {
                    return Some(cached.data.clone());
                }
            }
        }

        let contents = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) => {
                warn!(file = %path.display(), error = %e, "control file unreadable");
                return non_empty_object(&implicit);
            }
        };

        let parsed: Value = if contents.trim().is_empty() {
            Value::Object(Default::default())
        } else {
            match serde_json::from_str(&contents) {
                Ok(v) => v,
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "control file malformed");
                    return non_empty_object(&implicit);
                }
            }
        };

        let merged = merge(parsed, implicit);
        self.cache.lock().insert(path, CachedFile { mtime, data: merged.clone() });
        Some(merged)
    }

    fn pause_file_exists(&self) -> bool {
        self.staging_dir.join("PAUSE").exists()
    }

    fn pause_type(&self) -> Option<PauseType> {
        if self.pause_file_exists() {
            return Some(PauseType::All);
        }
        let pause = self.read_control_file("pause.json")?;
        let type_str = pause.get("type").and_then(Value::as_str).unwrap_or("all");
        Some(PauseType::from_str(type_str))
    }

    /// Blocks, polling every 5 seconds, until the pause clears or
    /// `shutdown` returns true.
    pub fn check_pause<F: Fn() -> bool>(&self, shutdown: F) {
        let Some(pause_type) = self.pause_type() else { return };
        info!(?pause_type, "paused; delete the pause file from control/ to resume");
        while !shutdown() {
            if self.pause_type().is_none() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_secs(5));
        }
        if !shutdown() {
            info!("resumed");
        }
    }

    pub fn is_fetch_paused(&self) -> bool {
        matches!(self.pause_type(), Some(PauseType::All) | Some(PauseType::FetchOnly))
    }

    pub fn is_encode_paused(&self) -> bool {
        matches!(self.pause_type(), Some(PauseType::All) | Some(PauseType::EncodeOnly))
    }

    pub fn should_skip(&self, filepath: &str) -> bool {
        let Some(skip) = self.read_control_file("skip.json") else { return false };
        let Some(paths) = skip.get("paths").and_then(Value::as_array) else { return false };
        paths
            .iter()
            .filter_map(Value::as_str)
            .any(|p| paths_equal(p, filepath))
    }

    pub fn get_gentle_override(&self, filepath: &str) -> Option<GentleOverride> {
        let gentle = self.read_control_file("gentle.json")?;

        if let Some(paths) = gentle.get("paths").and_then(Value::as_object) {
            for (p, overrides) in paths {
                if paths_equal(p, filepath) {
                    return serde_json::from_value(overrides.clone()).ok();
                }
            }
        }

        if let Some(patterns) = gentle.get("patterns").and_then(Value::as_object) {
            let norm = crate::util::normalize_for_compare(filepath);
            for (pattern, overrides) in patterns {
                if let Ok(glob) = glob::Pattern::new(&pattern.to_lowercase()) {
                    if glob.matches(&norm) {
                        return serde_json::from_value(overrides.clone()).ok();
                    }
                }
            }
        }

        let default_offset = gentle.get("default_offset").and_then(Value::as_i64).unwrap_or(0);
        if default_offset != 0 {
            return Some(GentleOverride {
                cq_offset: Some(default_offset as i32),
                cq: None,
                preset: None,
            });
        }

        None
    }

    pub fn get_priority_bumps(&self) -> Vec<String> {
        let Some(priority) = self.read_control_file("priority.json") else { return Vec::new() };
        priority
            .get("paths")
            .and_then(Value::as_array)
            .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default()
    }

    /// Drops skip-listed items and moves priority-bumped items to the
    /// front, preserving relative order within each group.
    pub fn apply_queue_overrides<T, F: Fn(&T) -> &str>(&self, queue: Vec<T>, filepath_of: F) -> Vec<T> {
        let filtered: Vec<T> = queue.into_iter().filter(|item| !self.should_skip(filepath_of(item))).collect();

        let bumps = self.get_priority_bumps();
        if bumps.is_empty() {
            return filtered;
        }

        let mut priority_items = Vec::new();
        let mut rest = Vec::new();
        for item in filtered {
            if bumps.iter().any(|b| paths_equal(b, filepath_of(&item))) {
                priority_items.push(item);
            } else {
                rest.push(item);
            }
        }
        if !priority_items.is_empty() {
            info!(count = priority_items.len(), "priority bumped files to front of queue");
        }
        priority_items.into_iter().chain(rest).collect()
    }
}

fn merge(data: Value, implicit: Value) -> Value {
    let mut merged = match data {
        Value::Object(m) => m,
        _ => Default::default(),
    };
    if let Value::Object(implicit_map) = implicit {
        for (k, v) in implicit_map {
            merged.insert(k, v);
        }
    }
    Value::Object(merged)
}

fn non_empty_object(implicit: &Value) -> Option<Value> {
    match implicit {
        Value::Object(m) if !m.is_empty() => Some(implicit.clone()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn seeds_persistent_files() {
        let dir = tempdir().unwrap();
        let _channel = ControlChannel::new(dir.path()).unwrap();
        assert!(dir.path().join("control/skip.json").exists());
        assert!(dir.path().join("control/priority.json").exists());
        assert!(dir.path().join("control/gentle.json").exists());
    }

    #[test]
    fn bare_pause_file_pauses_all() {
        let dir = tempdir().unwrap();
        let channel = ControlChannel::new(dir.path()).unwrap();
        assert!(!channel.is_fetch_paused());
        fs::write(dir.path().join("PAUSE"), "").unwrap();
        assert!(channel.is_fetch_paused());
        assert!(channel.is_encode_paused());
    }

    #[test]
    fn pause_encode_alias_leaves_fetch_running() {
        let dir = tempdir().unwrap();
        let channel = ControlChannel::new(dir.path()).unwrap();
        fs::write(dir.path().join("control/pause_encode.json"), "").unwrap();
        assert!(channel.is_encode_paused());
        assert!(!channel.is_fetch_paused());
    }

    #[test]
    fn skip_list_matches_case_insensitively() {
        let dir = tempdir().unwrap();
        let channel = ControlChannel::new(dir.path()).unwrap();
        fs::write(
            dir.path().join("control/skip.json"),
            r#"{"paths": ["Z:\\Movies\\Foo.mkv"]}"#,
        )
        .unwrap();
        assert!(channel.should_skip(r"z:\movies\foo.mkv"));
        assert!(!channel.should_skip(r"z:\movies\bar.mkv"));
    }

    #[test]
    fn gentle_override_exact_beats_pattern_beats_default() {
        let dir = tempdir().unwrap();
        let channel = ControlChannel::new(dir.path()).unwrap();
        fs::write(
            dir.path().join("control/gentle.json"),
            r#"{
                "paths": {"Z:\\Movies\\Interstellar.mkv": {"cq": 19}},
                "patterns": {"*interstellar*": {"cq_offset": -3}},
                "default_offset": 2
            }"#,
        )
        .unwrap();

        let exact = channel.get_gentle_override(r"Z:\Movies\Interstellar.mkv").unwrap();
        assert_eq!(exact.apply_cq(30), 19);

        let pattern = channel.get_gentle_override(r"Z:\Movies\The Interstellar Sequel.mkv").unwrap();
        assert_eq!(pattern.apply_cq(30), 27);

        let default = channel.get_gentle_override(r"Z:\Movies\Unrelated.mkv").unwrap();
        assert_eq!(default.apply_cq(30), 32);
    }

    #[test]
    fn gentle_override_floors_cq_offset_at_one() {
        let dir = tempdir().unwrap();
        let channel = ControlChannel::new(dir.path()).unwrap();
        fs::write(
            dir.path().join("control/gentle.json"),
            r#"{"paths": {}, "patterns": {}, "default_offset": -50}"#,
        )
        .unwrap();
        let ov = channel.get_gentle_override("anything.mkv").unwrap();
        assert_eq!(ov.apply_cq(10), 1);
    }

    #[test]
    fn priority_bumps_preserve_relative_order() {
        let dir = tempdir().unwrap();
        let channel = ControlChannel::new(dir.path()).unwrap();
        fs::write(
            dir.path().join("control/priority.json"),
            r#"{"paths": ["c", "a"]}"#,
        )
        .unwrap();
        let queue = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let result = channel.apply_queue_overrides(queue, |s: &String| s.as_str());
        assert_eq!(result, vec!["a", "c", "b"]);
    }
}
