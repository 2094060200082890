use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use tracing::{error, info, warn};

use crate::config::{Config, REMUX_EXTENSIONS};
use crate::control::ControlChannel;
use crate::error::StageError;
use crate::ffmpeg::{build_ffmpeg_cmd, get_duration, remux_to_mkv, tail_lines};
use crate::model::{FileStatus, WorkItem};
use crate::state::StateStore;
use crate::util::{format_bytes, format_duration, hash_path};

/// Remuxes the fetched input if its container is known to trip NVENC's
/// demuxer, shapes and runs the ffmpeg command, and on success records
/// bytes saved / compression ratio / encode time before cleaning up the
/// remux intermediate and the fetched input to free staging space.
/// Per-file `gentle.json` overrides (if any) are applied to CQ/preset
/// before the command is built.
pub fn stage_encode(
    item: &WorkItem,
    staging_dir: &Path,
    config: &Config,
    control: &ControlChannel,
    store: &StateStore,
) -> Result<PathBuf, StageError> {
    let record = store
        .get_file(&item.filepath)
        .ok_or_else(|| StageError::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "no record")))?;

    let local_input = record
        .local_input_path
        .as_ref()
        .map(PathBuf::from)
        .filter(|p| p.exists());
    let Some(local_input) = local_input else {
        error!(filepath = %item.filepath, "local file missing at encode stage");
        store.set_file(&item.filepath, |r| {
            r.status = FileStatus::Error;
            r.last_error = Some("local file missing".to_string());
            r.last_error_stage = Some("encode".to_string());
        })?;
        return Err(StageError::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "local file missing")));
    };

    let remuxed_path = if needs_remux(&local_input) { Some(remux_to_mkv(&local_input)?) } else { None };
    let encode_input = remuxed_path.clone().unwrap_or_else(|| local_input.clone());

    let encode_dir = staging_dir.join("encoded");
    fs::create_dir_all(&encode_dir)?;
    let stem = Path::new(&item.filename).file_stem().unwrap_or_default().to_string_lossy();
    let safe_name = format!("{}_{stem}.mkv", hash_path(&item.filepath));
    let output_path = encode_dir.join(safe_name);

    store.set_file(&item.filepath, |r| {
        r.status = FileStatus::Encoding;
        r.local_output_path = Some(output_path.to_string_lossy().to_string());
    })?;

    let params = config.resolve_encode_params(item);
    let gentle = control.get_gentle_override(&item.filepath);
    let effective_cq = gentle.as_ref().map(|ov| ov.apply_cq(params.cq)).unwrap_or(params.cq);

    // Patch the resolved cq/preset into a scratch config so the one
    // ffmpeg-command builder stays the single source of truth for flag shape.
    let mut config_for_cmd = config.clone();
    patch_resolved_params(&mut config_for_cmd, item, effective_cq, gentle.as_ref().and_then(|ov| ov.preset.clone()));

    info!(filename = %item.filename, "encoding");
    info!(
        content_type = %params.content_type,
        resolution = %item.resolution_class,
        hdr = item.hdr,
        cq = effective_cq,
        preset = %params.preset,
        multipass = %params.multipass,
        "encode parameters"
    );

    let mut cmd = build_ffmpeg_cmd(&encode_input, &output_path, item, &config_for_cmd);

    let start = Instant::now();
    let output = cmd.output().map_err(StageError::Io)?;
    let elapsed = start.elapsed().as_secs_f64();

    if !output.status.success() {
        let stderr_tail = tail_lines(&output.stderr, 5);
        error!(exit = output.status.code(), "encode failed");
        store.set_file(&item.filepath, |r| {
            r.status = FileStatus::Error;
            r.last_error = Some(format!("ffmpeg exit {:?}", output.status.code()));
            r.last_error_stage = Some("encode".to_string());
        })?;
        let _ = fs::remove_file(&output_path);
        if let Some(r) = &remuxed_path {
            let _ = fs::remove_file(r);
        }
        return Err(StageError::EncoderFailed {
            status: output.status.code().unwrap_or(-1),
            stderr_tail,
        });
    }

    if !output_path.exists() {
        store.set_file(&item.filepath, |r| {
            r.status = FileStatus::Error;
            r.last_error = Some("output not created".to_string());
            r.last_error_stage = Some("encode".to_string());
        })?;
        return Err(StageError::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "output not created")));
    }

    let output_size = fs::metadata(&output_path)?.len() as i64;
    let input_size = fs::metadata(&local_input)?.len() as i64;

    if output_size as f64 > input_size as f64 * 1.1 {
        warn!(output = %format_bytes(output_size), input = %format_bytes(input_size), "output larger than input");
    }

    if item.duration_seconds > 0.0 {
        let output_duration = get_duration(&output_path).unwrap_or(0.0);
        if (item.duration_seconds - output_duration).abs() > config.verify_duration_tolerance_secs {
            warn!(input = item.duration_seconds, output = output_duration, "duration mismatch");
        }
    }

    let saved = input_size - output_size;
    let ratio = if input_size > 0 { (1.0 - output_size as f64 / input_size as f64) * 100.0 } else { 0.0 };
    let speed_mbs = if elapsed > 0.0 { input_size as f64 / elapsed / (1024.0 * 1024.0) } else { 0.0 };

    info!(
        elapsed = %format_duration(elapsed),
        input = %format_bytes(input_size),
        output = %format_bytes(output_size),
        ratio = %format!("{ratio:.1}%"),
        saved = %format_bytes(saved),
        speed_mbs = %format!("{speed_mbs:.0}"),
        "encoded"
    );

    store.set_file(&item.filepath, |r| {
        r.status = FileStatus::Encoded;
        r.output_size_bytes = Some(output_size);
        r.input_size_bytes = Some(input_size);
        r.bytes_saved = Some(saved);
        r.compression_ratio = Some((ratio * 10.0).round() / 10.0);
        r.encode_time_secs = Some((elapsed * 10.0).round() / 10.0);
    })?;

    if let Some(r) = &remuxed_path {
        let _ = fs::remove_file(r);
    }
    fs::remove_file(&local_input)?;
    info!(freed = %format_bytes(input_size), "cleaned up fetched file");

    store.update_stats(|s| s.total_encode_time_secs += elapsed)?;

    Ok(output_path)
}

fn needs_remux(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|ext| REMUX_EXTENSIONS.contains(&format!(".{}", ext.to_lowercase()).as_str()))
        .unwrap_or(false)
}

fn patch_resolved_params(config: &mut Config, item: &WorkItem, cq: i32, preset: Option<String>) {
    let content_type = item.library_type.content_type();
    let res_key = item.res_key();
    let cq_table = if content_type == "movie" { &mut config.cq.movie } else { &mut config.cq.series };
    cq_table.insert(res_key.clone(), cq);
    if let Some(preset) = preset {
        let preset_table = if content_type == "movie" { &mut config.nvenc_preset.movie } else { &mut config.nvenc_preset.series };
        preset_table.insert(res_key, preset);
    }
}
