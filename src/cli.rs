use crate::{
    config::Config,
    engine::{CommandEngine, Engine},
    error::RunError,
    location::{Mode, OutputPrefix, RunTimestamp},
    orchestrator::{Orchestrator, Phase, RunOptions},
    report::RunReport,
    stats::Stats,
    storage::LocalStore,
    util::{ensure_dir, now_rfc3339},
};
use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use signal_hook::consts::SIGINT;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Parser, Debug)]
#[command(name = "doc-reader")]
#[command(about = "Convert PDF objects in storage to Markdown (batch or single-item)")]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Command,

    /// Path to config TOML. If omitted, uses ./doc-reader.toml if present.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Override log level (trace/debug/info/warn/error).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Single-item mode: storage://container/path of the document to convert.
    #[arg(long, env = "SOURCE_URI", global = true)]
    pub source_uri: Option<String>,

    /// Batch mode: container scanned for .pdf objects.
    #[arg(long, env = "INPUT_CONTAINER", global = true)]
    pub input_container: Option<String>,

    /// Batch mode: container receiving the markdown collection. Anything after
    /// the first `/` is ignored.
    #[arg(long, env = "OUTPUT_LOCATION_PREFIX", global = true)]
    pub output_prefix: Option<String>,

    /// Overrides storage.root from the config file.
    #[arg(long, env = "DOC_READER_STORAGE_ROOT", global = true)]
    pub storage_root: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Convert every selected document and publish the markdown.
    Run {},
    /// Show which documents would be converted and where the output would go.
    Plan {},
    /// Check that the converter program is usable.
    Doctor {},
}

/// Returns the process exit code.
pub fn dispatch(args: Args) -> Result<u8> {
    let cfg_path = resolve_config_path(args.config.as_deref());
    let cfg = match &cfg_path {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    let log_path = resolve_log_path(&cfg);
    let _guard = init_logging(&args, &cfg, log_path.as_deref())?;
    if let Some(path) = &cfg_path {
        info!("config={}", path.display());
    }

    match &args.cmd {
        Command::Run {} => run(&args, &cfg),
        Command::Plan {} => plan(&args, &cfg),
        Command::Doctor {} => doctor(&cfg),
    }
}

fn resolve_config_path(user: Option<&Path>) -> Option<PathBuf> {
    if let Some(p) = user {
        return Some(p.to_path_buf());
    }
    let default = PathBuf::from("doc-reader.toml");
    default.exists().then_some(default)
}

fn init_logging(args: &Args, cfg: &Config, file_path: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let level = args
        .log_level
        .as_deref()
        .unwrap_or(cfg.logging.level.as_str());

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let stdout_layer = if cfg.logging.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_current_span(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .boxed()
    };

    let (file_layer, guard) = if let Some(path) = file_path {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        ensure_dir(parent)?;
        let file = std::fs::File::create(path)
            .with_context(|| format!("create log file: {}", path.display()))?;
        let (non_blocking, guard) = tracing_appender::non_blocking(file);
        let layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false)
            .with_target(true)
            .boxed();
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| anyhow!("failed to init logging: {e}"))?;

    Ok(guard)
}

fn resolve_log_path(cfg: &Config) -> Option<PathBuf> {
    if !cfg.logging.write_to_file {
        return None;
    }
    if !cfg.logging.file_path.is_empty() {
        return Some(PathBuf::from(&cfg.logging.file_path));
    }
    Some(PathBuf::from("doc-reader.log"))
}

/// Init phase: settings, storage and converter handles. Nothing here touches
/// document content.
fn build(args: &Args, cfg: &Config, ts: RunTimestamp) -> Result<Orchestrator<LocalStore, CommandEngine>> {
    let mode = Mode::from_settings(
        args.source_uri.as_deref(),
        args.input_container.as_deref(),
        args.output_prefix.as_deref(),
    )?;
    info!(mode = mode.name(), "configuration validated");
    if let Mode::Batch {
        output: OutputPrefix {
            key_prefix: Some(prefix),
            ..
        },
        ..
    } = &mode
    {
        warn!(prefix = %prefix, "key prefix of OUTPUT_LOCATION_PREFIX is ignored");
    }

    let root = args
        .storage_root
        .clone()
        .unwrap_or_else(|| PathBuf::from(&cfg.storage.root));
    let store = LocalStore::open(&root)?;
    info!("storage root={}", store.root().display());

    let engine = CommandEngine::new(cfg)?;

    let options = RunOptions {
        max_input_bytes: cfg.limits.max_input_bytes,
        run_timeout: (cfg.limits.run_timeout_seconds > 0)
            .then(|| Duration::from_secs(cfg.limits.run_timeout_seconds)),
    };
    Ok(Orchestrator::new(mode, store, engine, ts).with_options(options))
}

/// First SIGINT sets the returned flag so the run stops between items; a
/// second one exits with 130 right away.
pub fn install_interrupt_flag() -> Result<Arc<AtomicBool>> {
    let flag = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register_conditional_shutdown(SIGINT, 130, Arc::clone(&flag))
        .context("registering SIGINT shutdown")?;
    signal_hook::flag::register(SIGINT, Arc::clone(&flag))
        .context("registering SIGINT handler")?;
    Ok(flag)
}

/// Init followed by the run. A failed Init is reported, not propagated.
pub fn execute(
    args: &Args,
    cfg: &Config,
    ts: RunTimestamp,
    interrupted: Arc<AtomicBool>,
) -> RunReport {
    match build(args, cfg, ts.clone()) {
        Ok(orchestrator) => orchestrator.with_interrupt_flag(interrupted).run(),
        Err(err) => {
            error!("failed to initialise run: {:#}", err);
            RunReport::failed(
                ts,
                None,
                Phase::Init,
                RunError::Configuration(format!("{err:#}")),
                Stats::default(),
                Vec::new(),
            )
        }
    }
}

fn run(args: &Args, cfg: &Config) -> Result<u8> {
    let started = now_rfc3339();
    let ts = RunTimestamp::now().context("formatting run timestamp")?;
    let interrupted = install_interrupt_flag()?;
    let report = execute(args, cfg, ts, interrupted);

    if report.is_success() {
        info!("document processing service completed successfully");
    } else {
        error!("document processing service failed");
    }

    if cfg.global.print_summary {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "started": started,
                "finished": now_rfc3339(),
                "exit_code": report.exit_code(),
                "report": report,
            }))?
        );
    }

    Ok(report.exit_code())
}

fn plan(args: &Args, cfg: &Config) -> Result<u8> {
    let ts = RunTimestamp::now().context("formatting run timestamp")?;
    let orchestrator = build(args, cfg, ts)?;
    match orchestrator.plan() {
        Ok(entries) => {
            println!("{}", serde_json::to_string_pretty(&entries)?);
            Ok(0)
        }
        Err(err) => {
            error!("{err}");
            Ok(err.exit_code())
        }
    }
}

fn doctor(cfg: &Config) -> Result<u8> {
    let engine = CommandEngine::new(cfg)?;
    let diag = engine.doctor()?;
    println!("{}", serde_json::to_string_pretty(&diag)?);
    Ok(if diag.ok { 0 } else { 1 })
}
