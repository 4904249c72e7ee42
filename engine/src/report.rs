//! Run report handed to notification collaborators.
//!
//! A `JobReport` is plain data: when the run ended, how it ended, and either
//! the job result or the error with any partial result. What a notifier does
//! with it (mail, chat, a JSON file) is up to the notifier.

use chrono::{DateTime, Local};
use serde::Serialize;
use uuid::Uuid;

use crate::config::JobConfig;
use crate::error::{EngineError, RunFailure};
use crate::model::JobResult;

/// Classified outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorClass {
    None,
    Files,
    Config,
    Connect,
    Transfer,
    SingleInstance,
    NotReady,
    Terminated,
    Other,
}

impl ErrorClass {
    pub fn of_result(result: &JobResult) -> Self {
        if result.has_errors() {
            ErrorClass::Files
        } else {
            ErrorClass::None
        }
    }

    pub fn of_error(error: &EngineError) -> Self {
        match error {
            EngineError::Config { .. } => ErrorClass::Config,
            EngineError::Connect { .. } => ErrorClass::Connect,
            EngineError::Transfer { .. } => ErrorClass::Transfer,
            EngineError::SingleInstance { .. } => ErrorClass::SingleInstance,
            EngineError::NotReady { .. } => ErrorClass::NotReady,
            EngineError::Terminated => ErrorClass::Terminated,
        }
    }

    /// Short heading for notifications.
    pub fn title(self) -> &'static str {
        match self {
            ErrorClass::None => "No errors",
            ErrorClass::Files => "File error(s)",
            ErrorClass::Config => "Configuration error",
            ErrorClass::Connect => "Connect error",
            ErrorClass::Transfer => "Transfer error",
            ErrorClass::SingleInstance => "Already running",
            ErrorClass::NotReady => "Not ready",
            ErrorClass::Terminated => "Terminated",
            ErrorClass::Other => "Another error",
        }
    }
}

/// Everything a notifier needs to know about a finished run.
#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub job_id: String,
    pub name: Option<String>,
    pub info: Option<String>,
    pub run_id: Uuid,
    pub source: String,
    pub target: String,
    pub start_time: DateTime<Local>,
    pub end_time: DateTime<Local>,
    pub class: ErrorClass,
    /// Final or partial result
    pub result: Option<JobResult>,
    /// Error text when the run failed
    pub error: Option<String>,
}

impl JobReport {
    /// Report for a run that ended with `outcome`.
    pub fn new(
        job: &JobConfig,
        run_id: Uuid,
        start_time: DateTime<Local>,
        outcome: Result<&JobResult, &RunFailure>,
    ) -> Self {
        let (class, result, error) = match outcome {
            Ok(result) => (ErrorClass::of_result(result), Some(result.clone()), None),
            Err(failure) => (
                ErrorClass::of_error(&failure.error),
                failure.result.clone(),
                Some(failure.error.to_string()),
            ),
        };
        JobReport {
            job_id: job.job_id.clone(),
            name: job.name.clone(),
            info: job.info.clone(),
            run_id,
            source: job.source.location.describe(),
            target: job.target.location.describe(),
            start_time,
            end_time: Local::now(),
            class,
            result,
            error,
        }
    }

    pub fn is_success(&self) -> bool {
        self.class == ErrorClass::None
    }

    pub fn duration(&self) -> chrono::Duration {
        self.end_time - self.start_time
    }

    /// One line per collected file, `<tag> <path> (<info>)`.
    pub fn file_lines(&self) -> Vec<String> {
        self.result
            .as_ref()
            .and_then(|result| result.file_list.as_ref())
            .map(|files| {
                files
                    .iter()
                    .map(|f| format!("{} {} ({})", f.tag, f.path, f.info))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Receives the report of every run, successful or not.
pub trait Notifier {
    fn notify(&self, report: &JobReport);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Location, SourceConfig, TargetConfig};
    use crate::model::{FileInfo, FileRecord, FileTag};
    use std::io;
    use std::time::Duration;

    fn job() -> JobConfig {
        JobConfig::new(
            "nightly",
            SourceConfig::new(Location::local("/in"), vec!["*".into()]),
            TargetConfig::new(Location::local("/out")),
        )
    }

    fn result(src_errors: usize) -> JobResult {
        JobResult {
            files_cnt: 1,
            src_error_cnt: src_errors,
            tgt_error_cnt: 0,
            file_list: Some(vec![FileRecord {
                path: "a.txt".into(),
                info: FileInfo::Duration(Duration::from_millis(1500)),
                tag: FileTag::Transferred,
            }]),
        }
    }

    #[test]
    fn test_success_report() {
        let r = result(0);
        let report = JobReport::new(&job(), Uuid::new_v4(), Local::now(), Ok(&r));
        assert!(report.is_success());
        assert_eq!(report.class.title(), "No errors");
        assert_eq!(report.file_lines(), vec!["= a.txt (1.500s)"]);
        assert!(report.duration() >= chrono::Duration::zero());
    }

    #[test]
    fn test_file_errors_classify_as_files() {
        let r = result(2);
        let report = JobReport::new(&job(), Uuid::new_v4(), Local::now(), Ok(&r));
        assert_eq!(report.class, ErrorClass::Files);
        assert!(!report.is_success());
    }

    #[test]
    fn test_failure_keeps_partial_result() {
        let failure = RunFailure::new(
            EngineError::Transfer {
                source: io::Error::from(io::ErrorKind::ConnectionReset),
            },
            Some(result(0)),
        );
        let report = JobReport::new(&job(), Uuid::new_v4(), Local::now(), Err(&failure));
        assert_eq!(report.class, ErrorClass::Transfer);
        assert_eq!(report.result.as_ref().map(|r| r.files_cnt), Some(1));
        assert!(report.error.as_deref().is_some_and(|e| e.starts_with("transfer failed")));
    }

    #[test]
    fn test_class_serializes_kebab_case() {
        let json = serde_json::to_string(&ErrorClass::SingleInstance).expect("serialize");
        assert_eq!(json, "\"single-instance\"");
    }
}
