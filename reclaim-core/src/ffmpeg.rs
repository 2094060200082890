//! Encoder command shaping and the two small ffmpeg/ffprobe invocations the
//! encode stage needs outside of the encode itself: container remux and
//! duration probing.

use std::path::Path;
use std::process::{Command, Stdio};

use tracing::{error, info};

use crate::config::Config;
use crate::error::StageError;
use crate::model::WorkItem;

/// Probes a file's duration in seconds via ffprobe. Returns `None` on any
/// failure — duration checks that rely on this treat absence as "unknown",
/// never as a mismatch.
pub fn get_duration(filepath: &Path) -> Option<f64> {
    let output = Command::new("ffprobe")
        .args(["-v", "quiet", "-print_format", "json", "-show_format"])
        .arg(filepath)
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .output()
        .ok()?;

    if !output.status.success() {
        return None;
    }

    let parsed: serde_json::Value = serde_json::from_slice(&output.stdout).ok()?;
    parsed
        .get("format")?
        .get("duration")?
        .as_str()?
        .parse::<f64>()
        .ok()
}

/// Stream-copy remux to `.remux.mkv`, used for containers known to trip
/// NVENC's demuxer. Returns the remuxed path.
pub fn remux_to_mkv(input_path: &Path) -> Result<std::path::PathBuf, StageError> {
    let remuxed_path = with_suffix(input_path, ".remux.mkv");
    info!(input = %input_path.display(), "remuxing to mkv before encode");

    let output = Command::new("ffmpeg")
        .args(["-y", "-i"])
        .arg(input_path)
        .args(["-map", "0", "-c", "copy"])
        .arg(&remuxed_path)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .map_err(StageError::Io)?;

    if !output.status.success() {
        let stderr_tail = tail_lines(&output.stderr, 5);
        error!(exit = output.status.code(), "remux failed");
        let _ = std::fs::remove_file(&remuxed_path);
        return Err(StageError::RemuxFailed { stderr_tail });
    }

    Ok(remuxed_path)
}

fn with_suffix(path: &Path, suffix: &str) -> std::path::PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(suffix);
    std::path::PathBuf::from(s)
}

/// Builds the NVENC AV1 ffmpeg command line for one item, following the
/// exact flag shape this pipeline has always used: declarative stream map,
/// forced 10-bit pixel format, spatial AQ always on, temporal AQ for movies
/// only, rate cap/buffer only when configured, HDR color metadata when
/// applicable, and per-stream smart audio handling.
pub fn build_ffmpeg_cmd(
    input_path: &Path,
    output_path: &Path,
    item: &WorkItem,
    config: &Config,
) -> Command {
    let params = config.resolve_encode_params(item);
    let pix_fmt = if item.hdr { &config.pixel_format_hdr } else { &config.pixel_format_sdr };

    let mut cmd = Command::new("ffmpeg");
    cmd.arg("-y").arg("-i").arg(input_path).args(["-map", "0"]);

    cmd.args(["-c:v", &config.video_codec])
        .args(["-cq", &params.cq.to_string()])
        .args(["-preset", &params.preset])
        .args(["-tune", "hq"])
        .args(["-rc", "vbr"])
        .args(["-b:v", "0"])
        .args(["-pix_fmt", pix_fmt]);

    if params.multipass != "disabled" {
        cmd.args(["-multipass", &params.multipass]);
    }
    if params.lookahead > 0 {
        cmd.args(["-rc-lookahead", &params.lookahead.to_string()]);
    }

    cmd.args(["-spatial-aq", "1"]);
    if params.content_type == "movie" {
        cmd.args(["-temporal-aq", "1"]);
    }

    if let Some(maxrate) = &params.maxrate {
        cmd.args(["-maxrate", maxrate]);
    }
    if let Some(bufsize) = &params.bufsize {
        cmd.args(["-bufsize", bufsize]);
    }

    if item.hdr {
        cmd.args(["-color_primaries", "bt2020"])
            .args(["-color_trc", "smpte2084"])
            .args(["-colorspace", "bt2020nc"]);
    }

    apply_audio_args(&mut cmd, item, config);

    cmd.args(["-c:s", "copy"]);
    cmd.arg(output_path);
    cmd
}

fn apply_audio_args(cmd: &mut Command, item: &WorkItem, config: &Config) {
    use crate::config::AudioMode;

    match config.audio_mode {
        AudioMode::Copy => {
            cmd.args(["-c:a", "copy"]);
        }
        AudioMode::Smart => {
            if item.audio_streams.is_empty() {
                cmd.args(["-c:a", "copy"]);
                return;
            }
            for (i, audio) in item.audio_streams.iter().enumerate() {
                let codec_name = audio.codec.to_lowercase();
                let is_lossless = audio.lossless || config.lossless_audio_codecs.contains(&codec_name);
                if is_lossless {
                    let bitrate = if audio.channels > 2 {
                        &config.audio_eac3_surround_bitrate
                    } else {
                        &config.audio_eac3_stereo_bitrate
                    };
                    cmd.arg(format!("-c:a:{i}")).arg("eac3");
                    cmd.arg(format!("-b:a:{i}")).arg(bitrate);
                } else {
                    cmd.arg(format!("-c:a:{i}")).arg("copy");
                }
            }
        }
    }
}

/// Last `n` lines of a stderr buffer, decoded lossily, for logging on
/// encoder/remux failure without holding the whole buffer.
pub fn tail_lines(stderr: &[u8], n: usize) -> String {
    let text = String::from_utf8_lossy(stderr);
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AudioStream, LibraryType};

    fn hdr_movie_item() -> WorkItem {
        WorkItem {
            filepath: "/media/a.mkv".into(),
            filename: "a.mkv".into(),
            file_size_bytes: 1,
            file_size_gb: 0.0,
            duration_seconds: 100.0,
            bitrate_kbps: 1.0,
            video_codec: "HEVC (H.265)".into(),
            video_codec_raw: "hevc".into(),
            resolution_class: "4K".into(),
            hdr: true,
            bit_depth: 10,
            audio_streams: vec![AudioStream {
                codec: "TrueHD".into(),
                codec_raw: "truehd".into(),
                lossless: true,
                channels: 8,
                language: None,
            }],
            subtitle_count: 1,
            library_type: LibraryType::Movie,
            priority_tier: 0,
            tier_name: "x".into(),
        }
    }

    #[test]
    fn builds_hdr_movie_command_with_color_metadata_and_eac3() {
        let cmd = build_ffmpeg_cmd(
            Path::new("in.mkv"),
            Path::new("out.mkv"),
            &hdr_movie_item(),
            &Config::default(),
        );
        let args: Vec<String> = cmd.get_args().map(|a| a.to_string_lossy().to_string()).collect();
        assert!(args.contains(&"bt2020".to_string()));
        assert!(args.contains(&"-temporal-aq".to_string()));
        assert!(args.contains(&"eac3".to_string()));
        assert!(args.contains(&"640k".to_string()));
    }

    #[test]
    fn tail_lines_keeps_only_last_n() {
        let stderr = b"a\nb\nc\nd\ne\nf\n".to_vec();
        assert_eq!(tail_lines(&stderr, 2), "e\nf");
    }
}
