//! Progress reporting trait.
//!
//! This module defines the ProgressCallback trait, which keeps the transfer
//! engine independent of how progress is shown. The CLI implements it for
//! `--verbose` output.

use std::time::Duration;

use crate::config::JobConfig;
use crate::error::EngineError;
use crate::model::{JobResult, Outcome};

/// Trait for receiving progress updates from a job run.
///
/// All methods are called synchronously from the thread running the job.
pub trait ProgressCallback: Send {
    /// Called when an attempt starts; `attempt` is zero based.
    fn on_attempt_started(&self, job: &JobConfig, attempt: u32);

    /// Called after a file or a discovery error was recorded in the ledger.
    fn on_file_completed(&self, job: &JobConfig, path: &str, outcome: &Outcome);

    /// Called when a failed attempt will be retried after `delay`.
    fn on_retry_scheduled(&self, job: &JobConfig, attempt: u32, delay: Duration, error: &EngineError);

    /// Called once when the run produced a result, even a partial one.
    fn on_job_completed(&self, job: &JobConfig, result: &JobResult);
}
