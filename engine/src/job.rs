//! Job orchestration module.
//!
//! This module provides the two entry points of the engine:
//! - `transfer`: one attempt, no lock, no ready gate, no retry
//! - `run`: the full pipeline (single-instance lock, log activation,
//!   ready gate, retries with backoff, reporting)
//!
//! Both drive the same attempt: connect the source, connect the target, walk
//! the source and store every selected file. Per-file failures are recorded
//! in the ledger and never end the attempt.

use std::time::Instant;

use chrono::Local;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::JobConfig;
use crate::endpoint::{Connector, EndpointFactory, Role};
use crate::error::{EngineError, RunFailure};
use crate::instance::InstanceLock;
use crate::logging::LogHandle;
use crate::model::{ExitStatus, JobResult, Ledger, Side};
use crate::progress::ProgressCallback;
use crate::report::{JobReport, Notifier};
use crate::retry::{RetryController, Sleeper, ThreadSleeper};
use crate::shutdown::Shutdown;
use crate::store::Target;
use crate::walker::{FileEntry, Source};

/// Collaborators of a run. `RunContext::new()` gives the production
/// defaults; tests swap the endpoint factory and the sleeper.
pub struct RunContext<'a> {
    pub factory: &'a dyn EndpointFactory,
    pub sleeper: &'a dyn Sleeper,
    pub shutdown: Shutdown,
    /// Activated once the single-instance lock is held
    pub log: Option<LogHandle>,
    pub progress: Option<&'a dyn ProgressCallback>,
    pub notifier: Option<&'a dyn Notifier>,
    /// Error to report through the normal failure path instead of running
    pub injected_failure: Option<EngineError>,
}

impl RunContext<'static> {
    pub fn new() -> Self {
        RunContext {
            factory: &Connector,
            sleeper: &ThreadSleeper,
            shutdown: Shutdown::new(),
            log: None,
            progress: None,
            notifier: None,
            injected_failure: None,
        }
    }
}

impl Default for RunContext<'static> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> RunContext<'a> {
    pub fn with_factory(mut self, factory: &'a dyn EndpointFactory) -> Self {
        self.factory = factory;
        self
    }

    pub fn with_sleeper(mut self, sleeper: &'a dyn Sleeper) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_shutdown(mut self, shutdown: Shutdown) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn with_log(mut self, log: LogHandle) -> Self {
        self.log = Some(log);
        self
    }

    pub fn with_progress(mut self, progress: &'a dyn ProgressCallback) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_notifier(mut self, notifier: &'a dyn Notifier) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_injected_failure(mut self, error: EngineError) -> Self {
        self.injected_failure = Some(error);
        self
    }
}

/// Settings of one attempt that differ between `transfer` and `run`.
struct AttemptEnv<'c> {
    factory: &'c dyn EndpointFactory,
    shutdown: &'c Shutdown,
    progress: Option<&'c dyn ProgressCallback>,
    /// Enforce the ready file and remove it after a clean attempt
    ready_gate: bool,
}

/// Run one attempt, recording outcomes in `ledger`.
///
/// Files already transferred according to the ledger, and the ready file,
/// are skipped without being opened. Both endpoints are released when this
/// function returns, whatever the outcome.
///
/// The ready file lives on the source, so the source is connected before the
/// gate is checked. A closed gate never opens the target and reads no file.
///
/// # Errors
/// `Connect` if an endpoint cannot be opened, `Transfer` if the walk fails
/// as a whole, `NotReady` if the ready gate is closed, `Terminated` on a
/// shutdown request.
fn attempt(
    config: &JobConfig,
    env: &AttemptEnv<'_>,
    ledger: &mut Ledger,
    index: u32,
) -> Result<(), EngineError> {
    ledger.begin_attempt();
    if env.shutdown.is_requested() {
        return Err(EngineError::Terminated);
    }
    if let Some(progress) = env.progress {
        progress.on_attempt_started(config, index);
    }

    let mut source = Source::new(
        env.factory.connect(Role::Source, &config.source.location)?,
        &config.source,
    )?;
    if env.ready_gate {
        if let Some(ready) = &config.ready_file {
            if !source.has_file(ready) {
                info!(ready_file = %ready, "ready file not found");
                return Err(EngineError::NotReady {
                    ready_file: ready.clone(),
                });
            }
        }
    }
    let mut target = Target::new(
        env.factory.connect(Role::Target, &config.target.location)?,
        &config.target,
    );
    info!(
        attempt = index + 1,
        source = %source.describe(),
        target = %target.describe(),
        "endpoints connected"
    );

    let done = ledger.transferred_paths();
    let ready_file = config.ready_file.as_deref();
    let mut walk = source.walk(|path| done.contains(path) || ready_file == Some(path));
    loop {
        if env.shutdown.is_requested() {
            warn!("termination requested");
            return Err(EngineError::Terminated);
        }
        let Some(entry) = walk.next() else {
            break;
        };
        let entry = entry.map_err(|e| EngineError::Transfer { source: e })?;
        let path = entry.path().to_string();
        match entry {
            FileEntry::Error { error, .. } => {
                ledger.record_error(&path, Side::Source, error);
            }
            FileEntry::Open { reader, .. } => {
                let started = Instant::now();
                match target.store(&path, reader) {
                    Ok(bytes) => {
                        let duration = started.elapsed();
                        info!(path = %path, bytes, ?duration, "Transferred");
                        ledger.record_transferred(&path, duration);
                        walk.complete(&path);
                    }
                    Err(e) => ledger.record_error(&path, Side::Target, e),
                }
            }
        }
        if let (Some(progress), Some(outcome)) = (env.progress, ledger.get(&path)) {
            progress.on_file_completed(config, &path, outcome);
        }
    }
    drop(walk);

    if env.ready_gate && !ledger.has_errors() {
        if let Some(ready) = &config.ready_file {
            match source.remove_file(ready) {
                Ok(()) => info!(ready_file = %ready, "ready file removed"),
                Err(e) => warn!(ready_file = %ready, error = %e, "could not remove ready file"),
            }
        }
    }
    Ok(())
}

/// Transfer files once.
///
/// Runs a single attempt without retry, single-instance lock or ready gate.
///
/// # Errors
/// `Config` for an invalid job, `Connect` or `Transfer` if the attempt
/// fails. Per-file errors are part of the returned result.
pub fn transfer(config: &JobConfig) -> Result<JobResult, EngineError> {
    transfer_with(config, &Connector)
}

/// Like [`transfer`], with endpoints built by `factory`.
pub fn transfer_with(
    config: &JobConfig,
    factory: &dyn EndpointFactory,
) -> Result<JobResult, EngineError> {
    config.validate()?;
    let shutdown = Shutdown::new();
    let env = AttemptEnv {
        factory,
        shutdown: &shutdown,
        progress: None,
        ready_gate: false,
    };
    let mut ledger = Ledger::new();
    attempt(config, &env, &mut ledger, 0)?;
    let result = JobResult::from_ledger(&ledger, config.collect_data);
    info!("Transfer completed: {}", result);
    Ok(result)
}

/// Run a job through the full pipeline.
///
/// Steps, in order:
/// 1. Validate the configuration.
/// 2. Acquire the single-instance lock, if configured.
/// 3. Activate the deferred log sink.
/// 4. Fail with the injected error, if one was supplied.
/// 5. Run attempts until one succeeds or the error escalates; every
///    attempt checks the ready gate first.
/// 6. Hand the report to the notifier.
///
/// # Returns
/// The job result and the exit status it maps to (`Success` or `Errors`).
///
/// # Errors
/// A `RunFailure` holding the error that ended the run and, once an attempt
/// was started, the partial result.
pub fn run(
    config: &JobConfig,
    mut ctx: RunContext<'_>,
) -> Result<(JobResult, ExitStatus), RunFailure> {
    let start_time = Local::now();
    let run_id = Uuid::new_v4();

    let outcome = run_pipeline(config, &mut ctx, run_id);

    let already_running = matches!(
        &outcome,
        Err(RunFailure {
            error: EngineError::SingleInstance { .. },
            ..
        })
    );
    if !already_running {
        if let Some(notifier) = ctx.notifier {
            let report = JobReport::new(config, run_id, start_time, outcome.as_ref());
            notifier.notify(&report);
        }
        info!(
            job_id = %config.job_id,
            duration = %(Local::now() - start_time),
            "Job finished"
        );
    }

    outcome.map(|result| {
        let status = result.exit_status();
        (result, status)
    })
}

fn run_pipeline(
    config: &JobConfig,
    ctx: &mut RunContext<'_>,
    run_id: Uuid,
) -> Result<JobResult, RunFailure> {
    config.validate()?;

    let _lock = match &config.single_instance {
        Some(lock) => {
            let name = config.lock_name().unwrap_or(&config.job_id);
            match InstanceLock::acquire(&lock.locks_dir, name) {
                Ok(guard) => Some(guard),
                Err(e) => {
                    if let Some(log) = &ctx.log {
                        log.disable();
                    }
                    return Err(e.into());
                }
            }
        }
        None => None,
    };

    if let Some(log) = &ctx.log {
        if let Err(e) = log.activate() {
            warn!(error = %e, "log file unavailable, logging to stderr");
        }
    }
    info!(job_id = %config.job_id, %run_id, "Job started");

    if let Some(injected) = ctx.injected_failure.take() {
        error!("{}", injected);
        return Err(injected.into());
    }

    let env = AttemptEnv {
        factory: ctx.factory,
        shutdown: &ctx.shutdown,
        progress: ctx.progress,
        ready_gate: true,
    };
    let mut ledger = Ledger::new();
    let mut started = false;
    let mut controller = RetryController::new(config.retry, ctx.sleeper, ctx.shutdown.clone());
    let outcome = controller.run(
        |index| {
            started = true;
            attempt(config, &env, &mut ledger, index)
        },
        |index, delay, error| {
            if let Some(progress) = ctx.progress {
                progress.on_retry_scheduled(config, index, delay, error);
            }
        },
    );

    let result = JobResult::from_ledger(&ledger, config.collect_data);
    match outcome {
        Ok(()) => {
            info!("Transfer completed: {}", result);
            if let Some(progress) = ctx.progress {
                progress.on_job_completed(config, &result);
            }
            Ok(result)
        }
        Err(e) => {
            match &e {
                EngineError::Connect { .. } => error!("Connect error: {}", e),
                EngineError::Transfer { .. } => error!("Transfer error: {}", e),
                EngineError::Terminated => error!("Terminated"),
                EngineError::NotReady { .. } => info!("{}", e),
                _ => error!("{}", e),
            }
            let partial = started.then_some(result);
            if let (Some(progress), Some(result)) = (ctx.progress, &partial) {
                progress.on_job_completed(config, result);
            }
            Err(RunFailure::new(e, partial))
        }
    }
}
