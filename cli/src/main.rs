//! filetransfer - Command-line interface for the transfer engine.
//!
//! Runs one configured job per invocation and maps its outcome to the
//! process exit code. Also maintains SFTP host keys in known_hosts files.

use anyhow::{bail, Context};
use chrono::Local;
use clap::{Parser, Subcommand};
use engine::{
    hostkeys,
    logging::{self, LogHandle},
    model::Outcome,
    run, AppConfig, EngineError, ExitStatus, JobConfig, JobReport, JobResult, Notifier,
    ProgressCallback, RunContext, Shutdown,
};
use std::fs;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{info, warn};

const DEFAULT_LOG_LEVEL: &str = "info";
const HOSTKEY_TIMEOUT: Duration = Duration::from_secs(30);

/// filetransfer - Unattended file transfer between local, FTP and SFTP endpoints
#[derive(Parser, Debug)]
#[command(name = "filetransfer")]
#[command(version)]
#[command(about = "Run file transfer jobs and maintain SFTP host keys")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the job JOB_ID
    Run {
        /// Job identifier; the job file is <jobs_dir>/<JOB_ID>.toml
        job_id: String,

        /// Application config file
        #[arg(short, long, value_name = "FILE", env = "FILETRANSFER_CFG")]
        config: PathBuf,

        /// Print per-file progress to stderr
        #[arg(short, long)]
        verbose: bool,

        /// Write the run report as JSON to FILE
        #[arg(long, value_name = "FILE")]
        report: Option<PathBuf>,
    },

    /// Maintain SFTP host keys
    Hostkey {
        #[command(subcommand)]
        action: HostkeyAction,
    },
}

#[derive(Subcommand, Debug)]
enum HostkeyAction {
    /// Fetch the host key of HOST and add it to FILE
    Get {
        host: String,
        /// known_hosts file
        file: PathBuf,
        #[arg(short, long, default_value_t = 22)]
        port: u16,
        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,
    },
    /// Delete the host key of HOST from FILE
    Delete {
        host: String,
        /// known_hosts file
        file: PathBuf,
        #[arg(short, long, default_value_t = 22)]
        port: u16,
    },
}

/// CLI implementation of ProgressCallback for `--verbose`
struct CliProgress {
    start_time: Instant,
}

impl CliProgress {
    fn new() -> Self {
        CliProgress {
            start_time: Instant::now(),
        }
    }

    fn format_duration(elapsed: Duration) -> String {
        let secs = elapsed.as_secs();
        let hours = secs / 3600;
        let mins = (secs % 3600) / 60;
        let secs = secs % 60;

        if hours > 0 {
            format!("{}h {}m {}s", hours, mins, secs)
        } else if mins > 0 {
            format!("{}m {}s", mins, secs)
        } else {
            format!("{}s", secs)
        }
    }
}

impl ProgressCallback for CliProgress {
    fn on_attempt_started(&self, job: &JobConfig, attempt: u32) {
        if attempt == 0 {
            eprintln!("Starting job {}...", job.job_id);
            eprintln!("  Source: {}", job.source.location.describe());
            eprintln!("  Target: {}", job.target.location.describe());
            eprintln!();
        } else {
            eprintln!("Attempt {} of {}", attempt + 1, job.retry.retries + 1);
        }
    }

    fn on_file_completed(&self, _job: &JobConfig, path: &str, outcome: &Outcome) {
        match outcome {
            Outcome::Transferred(duration) => {
                eprintln!("  Done: {} ({:.3}s)", path, duration.as_secs_f64())
            }
            Outcome::Failed { side, error } => eprintln!("  Failed ({}): {}: {}", side, path, error),
        }
    }

    fn on_retry_scheduled(&self, _job: &JobConfig, attempt: u32, delay: Duration, error: &EngineError) {
        eprintln!(
            "Attempt {} failed: {}; retrying in {:.1}s",
            attempt + 1,
            error,
            delay.as_secs_f64()
        );
    }

    fn on_job_completed(&self, _job: &JobConfig, result: &JobResult) {
        eprintln!();
        eprintln!("Summary: {}", result);
        eprintln!("Elapsed: {}", Self::format_duration(self.start_time.elapsed()));
    }
}

/// Notifier writing the run report to a JSON file
struct JsonReport {
    path: PathBuf,
}

impl JsonReport {
    fn write(&self, report: &JobReport) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(report).context("Failed to serialize report")?;
        fs::write(&self.path, json)
            .with_context(|| format!("Failed to write report {}", self.path.display()))
    }
}

impl Notifier for JsonReport {
    fn notify(&self, report: &JobReport) {
        if let Err(e) = self.write(report) {
            warn!("{:#}", e);
        }
    }
}

/// Parse arguments, dispatch, and exit with the run's status code
fn main() {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            let status = if e.use_stderr() {
                ExitStatus::CmdLine.code()
            } else {
                ExitStatus::Success.code()
            };
            std::process::exit(status);
        }
    };

    let status = run_cli(&args);
    std::process::exit(status.code());
}

/// Main CLI logic - separated for testability
fn run_cli(args: &Args) -> ExitStatus {
    match &args.command {
        Command::Run {
            job_id,
            config,
            verbose,
            report,
        } => run_job(job_id, config, *verbose, report.clone()),
        Command::Hostkey { action } => match run_hostkey(action) {
            Ok(()) => ExitStatus::Success,
            Err(e) => {
                eprintln!("Error: {:#}", e);
                ExitStatus::Failure
            }
        },
    }
}

fn install_logging(app: &AppConfig, job_id: &str) -> Option<LogHandle> {
    let level = app.logging.log_level.as_deref().unwrap_or(DEFAULT_LOG_LEVEL);
    let target = logging::log_target(&app.logging, job_id, Local::now());
    match logging::init(level, target) {
        Ok(handle) => Some(handle),
        Err(e) => {
            eprintln!("Warning: {}", e);
            None
        }
    }
}

fn install_shutdown_handler() -> Shutdown {
    let shutdown = Shutdown::new();
    let flag = shutdown.clone();
    if let Err(e) = ctrlc::set_handler(move || flag.request()) {
        eprintln!("Warning: cannot install termination handler: {}", e);
    }
    shutdown
}

fn run_job(job_id: &str, config: &Path, verbose: bool, report: Option<PathBuf>) -> ExitStatus {
    let (app, job) = match AppConfig::load(config).and_then(|app| {
        let job = app.load_job(job_id)?;
        Ok((app, job))
    }) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("Error: {}", e);
            return e.exit_status();
        }
    };
    let log = install_logging(&app, job_id);

    let progress = CliProgress::new();
    let notifier = report.map(|path| JsonReport { path });

    let mut ctx = RunContext::new().with_shutdown(install_shutdown_handler());
    if let Some(log) = log {
        ctx = ctx.with_log(log);
    }
    if verbose {
        ctx = ctx.with_progress(&progress);
    }
    if let Some(notifier) = &notifier {
        ctx = ctx.with_notifier(notifier);
    }

    match run(&job, ctx) {
        Ok((result, status)) => {
            info!(status = status.description(), "{}", result);
            status
        }
        Err(failure) => {
            let status = failure.error.exit_status();
            if status != ExitStatus::NotReady {
                eprintln!("Error: {}", failure);
            }
            status
        }
    }
}

fn confirm(prompt: &str) -> anyhow::Result<bool> {
    eprint!("{} [y/N] ", prompt);
    io::stderr().flush()?;
    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim(), "y" | "Y" | "yes"))
}

fn run_hostkey(action: &HostkeyAction) -> anyhow::Result<()> {
    match action {
        HostkeyAction::Get {
            host,
            file,
            port,
            yes,
        } => {
            let key = hostkeys::fetch(host, *port, Some(HOSTKEY_TIMEOUT))?;
            println!("{} {}", hostkeys::known_hosts_name(host, *port), key.key_type);
            println!("  MD5:{}", key.md5_fingerprint());
            println!("  SHA256:{}", key.sha256_fingerprint());
            if !yes && !confirm(&format!("Add this key to {}?", file.display()))? {
                bail!("Host key not saved");
            }
            let replaced = hostkeys::add(file, host, *port, &key)
                .with_context(|| format!("Failed to update {}", file.display()))?;
            println!("Host key {}", if replaced { "replaced" } else { "added" });
        }
        HostkeyAction::Delete { host, file, port } => {
            let removed = hostkeys::delete(file, host, *port)
                .with_context(|| format!("Failed to update {}", file.display()))?;
            if !removed {
                bail!("No entry for {} in {}", hostkeys::known_hosts_name(host, *port), file.display());
            }
            println!("Host key deleted");
        }
    }
    Ok(())
}
