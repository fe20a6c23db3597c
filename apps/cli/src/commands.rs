//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

use indexsync_core::{Pipeline, ProgressReporter, RunOptions, RunReport, Stage};
use indexsync_jobs::{ControlAction, Job, JobState, JobStore};
use indexsync_shared::{AppConfig, init_config, load_config, load_config_from};
use indexsync_source::ClientCache;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// indexsync: keep a search index in step with remote content.
#[derive(Parser)]
#[command(
    name = "indexsync",
    version,
    about = "Sync remote content into a search index and manage the jobs that do it.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Config file (defaults to ~/.indexsync/indexsync.toml).
    #[arg(long, env = "INDEXSYNC_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Run the sync pipeline as a job.
    Run {
        /// Only these sources (repeatable). Defaults to all.
        #[arg(short, long = "source")]
        sources: Vec<String>,

        /// Refetch and republish everything.
        #[arg(long)]
        full: bool,

        /// Plan and log without touching durable state.
        #[arg(long)]
        dry_run: bool,
    },

    /// Inspect and control jobs.
    Jobs {
        #[command(subcommand)]
        action: JobsAction,
    },

    /// Exercise the job directory end to end.
    Selftest,

    /// Configuration management.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
pub(crate) enum JobsAction {
    /// List jobs, newest first.
    List {
        #[arg(long)]
        category: Option<String>,

        /// running, paused, completed or cancelled.
        #[arg(long)]
        state: Option<String>,
    },
    /// Print one job as JSON.
    Get { id: u64 },
    /// Replay a job's events and follow it until it ends.
    Monitor {
        id: u64,

        /// Print what is there now and exit.
        #[arg(long)]
        once: bool,
    },
    /// Ask a job to pause, resume or cancel.
    Control {
        id: u64,

        action: ControlArg,

        /// Cancel a stale job directly instead of leaving a marker.
        #[arg(long)]
        force: bool,
    },
    /// Delete a finished job.
    Delete { id: u64 },
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
pub(crate) enum ControlArg {
    Pause,
    Resume,
    Cancel,
}

impl From<ControlArg> for ControlAction {
    fn from(arg: ControlArg) -> Self {
        match arg {
            ControlArg::Pause => ControlAction::Pause,
            ControlArg::Resume => ControlAction::Resume,
            ControlArg::Cancel => ControlAction::Cancel,
        }
    }
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

const CRATES: [&str; 8] = [
    "indexsync",
    "indexsync_core",
    "indexsync_jobs",
    "indexsync_sync",
    "indexsync_source",
    "indexsync_transform",
    "indexsync_publish",
    "indexsync_shared",
];

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = CRATES
        .iter()
        .map(|c| format!("{c}={level}"))
        .collect::<Vec<_>>()
        .join(",");

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config.as_deref();
    match cli.command {
        Command::Run {
            sources,
            full,
            dry_run,
        } => {
            let options = RunOptions {
                full,
                dry_run,
                sources,
            };
            cmd_run(&load(config_path)?, options).await
        }
        Command::Jobs { action } => {
            let config = load(config_path)?;
            let store = JobStore::new(&config.jobs.dir).with_stale_after(config.jobs.stale_after());
            match action {
                JobsAction::List { category, state } => {
                    cmd_jobs_list(&store, category.as_deref(), state.as_deref())
                }
                JobsAction::Get { id } => cmd_jobs_get(&store, id),
                JobsAction::Monitor { id, once } => {
                    cmd_jobs_monitor(&store, &config, id, once).await
                }
                JobsAction::Control { id, action, force } => {
                    cmd_jobs_control(&store, id, action.into(), force)
                }
                JobsAction::Delete { id } => {
                    store.delete(id)?;
                    println!("deleted job {id}");
                    Ok(())
                }
            }
        }
        Command::Selftest => cmd_selftest(&load(config_path)?).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init(config_path),
            ConfigAction::Show => cmd_config_show(&load(config_path)?),
        },
    }
}

fn load(path: Option<&Path>) -> Result<AppConfig> {
    Ok(match path {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    })
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_run(config: &AppConfig, options: RunOptions) -> Result<()> {
    if config.sources.is_empty() {
        return Err(eyre!("no sources configured; add [[sources]] to the config file"));
    }

    let cache = ClientCache::new();
    let pipeline = Pipeline::from_config(config, &cache)?;
    info!(
        sources = ?pipeline.source_names(),
        full = options.full,
        dry_run = options.dry_run,
        "starting run"
    );

    let reporter = CliProgress::new();
    let run = indexsync_core::run_sync_job(&config.jobs, &pipeline, &options, &reporter).await?;

    println!();
    println!("  Job:    {}", run.job_id);
    println!("  State:  {}", run.state);
    if let Some(summary) = reporter.summary() {
        println!("  Result: {summary}");
    }
    println!();

    if !run.result.ok && run.state != JobState::Cancelled {
        return Err(eyre!("job {} failed: {}", run.job_id, run.result.error));
    }
    Ok(())
}

fn cmd_jobs_list(store: &JobStore, category: Option<&str>, state: Option<&str>) -> Result<()> {
    let state = state
        .map(|s| {
            JobState::from_extension(s).ok_or_else(|| {
                eyre!("unknown state '{s}': expected running, paused, completed or cancelled")
            })
        })
        .transpose()?;

    let jobs = store.list(category, state)?;
    if jobs.is_empty() {
        println!("no jobs");
        return Ok(());
    }

    let now = chrono::Utc::now();
    println!(
        "{:>6}  {:<10}  {:<10}  {:<10}  {:<16}  STARTED",
        "ID", "STATE", "CATEGORY", "ACTION", "OBJECT"
    );
    for job in &jobs {
        let stale = if store.is_stale(job, now) { " (stale)" } else { "" };
        println!(
            "{:>6}  {:<10}  {:<10}  {:<10}  {:<16}  {}{stale}",
            job.job_id,
            job.state.to_string(),
            job.category,
            job.action,
            job.object_id.as_deref().unwrap_or("-"),
            job.started_at.format("%Y-%m-%d %H:%M:%S"),
        );
    }
    Ok(())
}

fn cmd_jobs_get(store: &JobStore, id: u64) -> Result<()> {
    let job = store.get(id)?;
    println!("{}", serde_json::to_string_pretty(&job)?);
    Ok(())
}

async fn cmd_jobs_monitor(store: &JobStore, config: &AppConfig, id: u64, once: bool) -> Result<()> {
    let job = if once {
        let job = store.get(id)?;
        job.events.iter().for_each(|e| println!("{}", e.summary()));
        job
    } else {
        let poll = config.jobs.poll_interval();
        store.follow(id, poll, |e| println!("{}", e.summary())).await?
    };
    print_status(&job);
    Ok(())
}

fn cmd_jobs_control(store: &JobStore, id: u64, action: ControlAction, force: bool) -> Result<()> {
    let job = store.request_control(id, action, force)?;
    if force && job.state == JobState::Cancelled {
        println!("job {id} force-cancelled");
    } else {
        println!("{action} requested for job {id} ({})", job.state);
    }
    Ok(())
}

async fn cmd_selftest(config: &AppConfig) -> Result<()> {
    let report = indexsync_core::selftest(&config.jobs).await?;
    for check in &report.checks {
        let mark = if check.ok { "ok  " } else { "FAIL" };
        if check.detail.is_empty() {
            println!("  [{mark}] {}", check.name);
        } else {
            println!("  [{mark}] {}: {}", check.name, check.detail);
        }
    }
    println!("  job {} in {} ms", report.job_id, report.elapsed_ms);
    if !report.ok() {
        return Err(eyre!("selftest failed in {}", config.jobs.dir.display()));
    }
    Ok(())
}

fn cmd_config_init(path: Option<&Path>) -> Result<()> {
    let path = match path {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, toml::to_string_pretty(&AppConfig::default())?)?;
            path.to_path_buf()
        }
        None => init_config()?,
    };
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show(config: &AppConfig) -> Result<()> {
    let toml_str = toml::to_string_pretty(config)?;
    println!("{toml_str}");
    Ok(())
}

fn print_status(job: &Job) {
    match &job.result {
        Some(result) if result.ok => println!("job {} {}", job.job_id, job.state),
        Some(result) => println!("job {} {}: {}", job.job_id, job.state, result.error),
        None => println!("job {} {}", job.job_id, job.state),
    }
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
    summary: std::sync::Mutex<Option<String>>,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan} {msg}") {
            spinner.set_style(
                style.tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
            );
        }
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
        Self {
            spinner,
            summary: std::sync::Mutex::new(None),
        }
    }

    fn summary(&self) -> Option<String> {
        self.summary.lock().ok().and_then(|s| s.clone())
    }
}

impl ProgressReporter for CliProgress {
    fn phase(&self, name: &str) {
        self.spinner.set_message(name.to_string());
    }

    fn item(&self, stage: Stage, path: &str, current: usize, total: usize) {
        self.spinner
            .set_message(format!("{stage} [{current}/{total}] {path}"));
    }

    fn done(&self, report: &RunReport) {
        if let Ok(mut summary) = self.summary.lock() {
            *summary = Some(report.summary());
        }
        self.spinner.finish_and_clear();
    }
}
