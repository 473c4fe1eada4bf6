//! Hailstone command-line search driver.
//!
//! ## Usage
//!
//! ```bash
//! # Search on the first discrete GPU until interrupted
//! hailstone
//!
//! # Resume from a config file and stop at the next record
//! hailstone --config search.json --until-record
//!
//! # Run 1000 batches of 4096 values on the CPU
//! hailstone --backend host --iter-size 4096 --batches 1000
//! ```
//!
//! The run summary is printed to stdout as JSON; logs go to stderr.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, ValueEnum};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use hailstone::{run_search, BackendKind, CancelToken, SearchConfig, Termination};
use hailstone_core::{BindingStyle, ElementLayout};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LayoutArg {
    Compact16,
    Wide64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum BindingArg {
    Separate,
    Combined,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum BackendArg {
    Vulkan,
    Host,
}

#[derive(Parser, Debug)]
#[command(name = "hailstone")]
#[command(author = "Daemoniorum LLC")]
#[command(version)]
#[command(about = "Resumable Collatz step-count record search", long_about = None)]
struct Args {
    /// Configuration file path (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Values per batch
    #[arg(long)]
    iter_size: Option<u32>,

    /// Fraction of each heap the search may use
    #[arg(long)]
    memory_budget: Option<f64>,

    /// Output element layout
    #[arg(long, value_enum)]
    layout: Option<LayoutArg>,

    /// Descriptor binding style
    #[arg(long, value_enum)]
    binding: Option<BindingArg>,

    /// Slot backend
    #[arg(long, value_enum)]
    backend: Option<BackendArg>,

    /// Stop after this many batches
    #[arg(long, conflicts_with = "until_record")]
    batches: Option<u64>,

    /// Stop at the first record beating the resumed one
    #[arg(long)]
    until_record: bool,

    /// Ignore any existing checkpoint
    #[arg(long)]
    restart: bool,

    /// Checkpoint file
    #[arg(long)]
    checkpoint: Option<PathBuf>,

    /// Write checkpoints on the scheduler thread
    #[arg(long)]
    inline_checkpoints: bool,

    /// Pipeline cache file
    #[arg(long, conflicts_with = "no_pipeline_cache")]
    pipeline_cache: Option<PathBuf>,

    /// Do not load or save a pipeline cache
    #[arg(long)]
    no_pipeline_cache: bool,

    /// Precompiled SPIR-V kernel to use instead of the built-in one
    #[arg(long)]
    shader: Option<PathBuf>,

    /// Physical device index
    #[arg(long)]
    device: Option<usize>,

    /// Upper bound on concurrent slots
    #[arg(long)]
    max_slots: Option<u32>,

    /// Preferred workgroup size
    #[arg(long)]
    workgroup_size: Option<u32>,

    /// Leading batches cross-checked against the host reference
    #[arg(long)]
    validate_batches: Option<u64>,
}

impl Args {
    /// Builds the effective configuration: file (or defaults), then flags.
    fn config(&self) -> hailstone::Result<SearchConfig> {
        let mut config = match &self.config {
            Some(path) => SearchConfig::load(path)?,
            None => SearchConfig::default(),
        };

        if let Some(v) = self.iter_size {
            config.iter_size = v;
        }
        if let Some(v) = self.memory_budget {
            config.memory_budget = v;
        }
        if let Some(layout) = self.layout {
            config.element_layout = match layout {
                LayoutArg::Compact16 => ElementLayout::Compact16,
                LayoutArg::Wide64 => ElementLayout::Wide64,
            };
        }
        if let Some(binding) = self.binding {
            config.binding_style = match binding {
                BindingArg::Separate => BindingStyle::Separate,
                BindingArg::Combined => BindingStyle::Combined,
            };
        }
        if let Some(backend) = self.backend {
            config.backend = match backend {
                BackendArg::Vulkan => BackendKind::Vulkan,
                BackendArg::Host => BackendKind::Host,
            };
        }
        if let Some(limit) = self.batches {
            config.termination = Termination::Batches { limit };
        }
        if self.until_record {
            config.termination = Termination::NewRecord;
        }
        config.restart |= self.restart;
        if let Some(path) = &self.checkpoint {
            config.checkpoint_path = path.clone();
        }
        if self.inline_checkpoints {
            config.background_checkpoints = false;
        }
        if let Some(path) = &self.pipeline_cache {
            config.pipeline_cache_path = Some(path.clone());
        }
        if self.no_pipeline_cache {
            config.pipeline_cache_path = None;
        }
        if let Some(path) = &self.shader {
            config.shader_path = Some(path.clone());
        }
        if self.device.is_some() {
            config.device_index = self.device;
        }
        if let Some(v) = self.max_slots {
            config.max_slots = v;
        }
        if let Some(v) = self.workgroup_size {
            config.workgroup_size = v;
        }
        if let Some(v) = self.validate_batches {
            config.validate_batches = v;
        }
        Ok(config)
    }
}

fn main() -> ExitCode {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.log_level.to_lowercase()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let config = match args.config() {
        Ok(config) => config,
        Err(e) => {
            error!(category = e.category(), "{}", e);
            return ExitCode::from(2);
        }
    };

    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || handler_token.cancel()) {
        warn!(error = %e, "interrupt handler unavailable, stop with a batch limit");
    }

    match run_search(&config, cancel) {
        Ok(outcome) => {
            info!(
                stop = ?outcome.report.stop_reason,
                best = %outcome.report.best,
                frontier = %outcome.report.frontier,
                "search finished"
            );
            match serde_json::to_string_pretty(&outcome) {
                Ok(json) => println!("{}", json),
                Err(e) => warn!(error = %e, "failed to serialize run report"),
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(category = e.category(), "{}", e);
            if e.is_planning() {
                ExitCode::from(2)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}
