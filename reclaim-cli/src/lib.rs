use std::fs;
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use reclaim_core::config::AudioMode;
use reclaim_core::{build_priority_queue, build_report_index, Config, Orchestrator, StateStore};

mod logging;

pub use logging::{init_logging, LogLevel};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum AudioModeArg {
    Copy,
    Smart,
}

/// Crash-safe, resumable transcode of a media library to AV1 in place.
#[derive(Parser, Debug)]
#[clap(name = "reclaim", version)]
pub struct CliOpts {
    /// Path to the media report JSON produced by the probe step.
    #[clap(long)]
    pub report: PathBuf,

    /// Local staging directory for in-flight fetch/encode artifacts.
    #[clap(long)]
    pub staging: PathBuf,

    /// Path to the durable pipeline state file.
    #[clap(long, default_value = "pipeline_state.json")]
    pub state_file: PathBuf,

    /// Resume a previous run using the existing state file (implicit if the
    /// file already exists; this flag only documents intent).
    #[clap(long)]
    pub resume: bool,

    /// Print the resolved queue and encode parameters without touching any files.
    #[clap(long)]
    pub dry_run: bool,

    /// Leave AV1 outputs alongside sources instead of replacing the originals.
    #[clap(long)]
    pub no_replace: bool,

    /// Audio handling mode.
    #[clap(long, value_enum)]
    pub audio: Option<AudioModeArg>,

    /// Override the staging budget, in GB.
    #[clap(long)]
    pub max_staging_gb: Option<f64>,

    /// Override the fetch buffer budget, in GB.
    #[clap(long)]
    pub max_fetch_gb: Option<f64>,

    /// Restrict the run to a single named priority tier.
    #[clap(long)]
    pub tier: Option<String>,

    /// Optional JSON config overlay applied on top of the built-in defaults.
    #[clap(long)]
    pub config: Option<PathBuf>,

    /// Console/file log level.
    #[clap(long, value_enum, default_value_t = LogLevel::Info)]
    pub log_level: LogLevel,

    /// Log file location. Defaults to `<staging>/reclaim.log`.
    #[clap(long)]
    pub log_file: Option<PathBuf>,
}

fn load_config(opts: &CliOpts) -> Result<Config> {
    let mut config = if let Some(path) = &opts.config {
        let raw = fs::read_to_string(path).with_context(|| format!("reading config overlay {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing config overlay {}", path.display()))?
    } else {
        Config::default()
    };

    if opts.no_replace {
        config.replace_original = false;
    }
    if let Some(audio) = opts.audio {
        config.audio_mode = match audio {
            AudioModeArg::Copy => AudioMode::Copy,
            AudioModeArg::Smart => AudioMode::Smart,
        };
    }
    if let Some(gb) = opts.max_staging_gb {
        config.max_staging_bytes = (gb * 1_000_000_000.0) as i64;
    }
    if let Some(gb) = opts.max_fetch_gb {
        config.max_fetch_buffer_bytes = (gb * 1_000_000_000.0) as i64;
    }
    if let Some(tier) = &opts.tier {
        config.priority_tiers.retain(|t| &t.name == tier);
        anyhow::ensure!(!config.priority_tiers.is_empty(), "no priority tier named {tier:?}");
    }

    Ok(config)
}

pub fn run() -> Result<()> {
    let opts = CliOpts::parse();

    fs::create_dir_all(&opts.staging).with_context(|| format!("creating staging dir {}", opts.staging.display()))?;
    let log_file = opts.log_file.clone().unwrap_or_else(|| opts.staging.join("reclaim.log"));
    let _guard = init_logging(opts.log_level, log_file);

    if !opts.report.exists() {
        tracing::error!(report = %opts.report.display(), "report file not found");
        process::exit(1);
    }
    let report_json = fs::read_to_string(&opts.report)
        .with_context(|| format!("reading report {}", opts.report.display()))?;

    let config = load_config(&opts)?;

    let state_path = if opts.state_file.is_absolute() {
        opts.state_file.clone()
    } else {
        opts.staging.join(&opts.state_file)
    };
    let store = StateStore::load_or_create(&state_path, config.clone())?;
    store.recover_zombies()?;

    let queue = build_priority_queue(&report_json, &config, &store)?;
    let report_index = build_report_index(&report_json)?;

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = shutdown.clone();
        let mut interrupted_once = false;
        ctrlc::set_handler(move || {
            if interrupted_once {
                tracing::warn!("second interrupt, forcing exit");
                process::exit(1);
            }
            interrupted_once = true;
            tracing::info!("interrupt received, requesting graceful shutdown");
            shutdown.store(true, Ordering::SeqCst);
        })
        .context("installing interrupt handler")?;
    }

    let orchestrator = Orchestrator::new(config, &opts.staging, store, shutdown)?;
    orchestrator.run(queue, &report_index, opts.dry_run)?;

    Ok(())
}
