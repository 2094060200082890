//! Small formatting and path helpers shared across stages.

use std::path::Path;

/// Human-readable byte count, matching the thresholds the pipeline has
/// always logged at (TB / GB / MB / KB).
pub fn format_bytes(bytes: i64) -> String {
    let b = bytes as f64;
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;
    const TB: f64 = GB * 1024.0;

    if b.abs() >= TB {
        format!("{:.2} TB", b / TB)
    } else if b.abs() >= GB {
        format!("{:.1} GB", b / GB)
    } else if b.abs() >= MB {
        format!("{:.0} MB", b / MB)
    } else {
        format!("{:.0} KB", b / KB)
    }
}

/// Human-readable duration, matching the original's `Ns` / `Nm Ss` / `Nh Mm` bands.
pub fn format_duration(secs: f64) -> String {
    if secs < 60.0 {
        format!("{secs:.0}s")
    } else if secs < 3600.0 {
        format!("{:.0}m {:.0}s", (secs / 60.0).floor(), secs % 60.0)
    } else {
        format!("{:.0}h {:.0}m", (secs / 3600.0).floor(), (secs % 3600.0) / 60.0)
    }
}

/// 12 hex characters of the MD5 of `source`, used as a collision- and
/// path-length-safe prefix for staged filenames.
pub fn hash_path(source: &str) -> String {
    let digest = md5::compute(source.as_bytes());
    format!("{digest:x}")[..12].to_owned()
}

/// Case-insensitive path equality after lexical normalization, used by the
/// skip list, priority list, and gentle overrides to compare operator-typed
/// paths against report/queue paths regardless of case or `./`-style noise.
pub fn paths_equal(a: &str, b: &str) -> bool {
    normalize_for_compare(a) == normalize_for_compare(b)
}

pub fn normalize_for_compare(p: &str) -> String {
    Path::new(p)
        .components()
        .collect::<std::path::PathBuf>()
        .to_string_lossy()
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_bytes_by_magnitude() {
        assert_eq!(format_bytes(500), "0 KB");
        assert_eq!(format_bytes(2048), "2 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5 MB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3.0 GB");
    }

    #[test]
    fn formats_duration_bands() {
        assert_eq!(format_duration(45.0), "45s");
        assert_eq!(format_duration(90.0), "1m 30s");
        assert_eq!(format_duration(3660.0), "1h 1m");
    }

    #[test]
    fn hash_path_is_stable_and_twelve_hex_chars() {
        let h1 = hash_path(r"Z:\Movies\Interstellar\Interstellar.mkv");
        let h2 = hash_path(r"Z:\Movies\Interstellar\Interstellar.mkv");
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 12);
        assert!(h1.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn paths_equal_ignores_case_and_separators() {
        assert!(paths_equal(r"Z:\Movies\Foo.mkv", r"z:\movies\foo.mkv"));
        assert!(!paths_equal(r"Z:\Movies\Foo.mkv", r"Z:\Movies\Bar.mkv"));
    }
}
