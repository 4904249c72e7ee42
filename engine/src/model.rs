//! Core data model for transfer jobs.
//!
//! This module defines the data carried through a job run:
//! - Ledger: per-path outcomes, shared across the retry attempts of one run
//! - JobResult: immutable snapshot built from the ledger after the last attempt
//! - Side, FileTag, FileInfo, ExitStatus: enums describing outcomes

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::io;
use std::time::Duration;

use serde::Serialize;

use crate::error::first_line;

/// Which side of the transfer a per-file error happened on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Source,
    Target,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Source => write!(f, "source"),
            Side::Target => write!(f, "target"),
        }
    }
}

/// Outcome of one file within a job run.
#[derive(Debug)]
pub enum Outcome {
    /// Stored successfully; the value is how long the store took
    Transferred(Duration),
    /// Discovery error (source) or store error (target)
    Failed { side: Side, error: io::Error },
}

impl Outcome {
    pub fn is_transferred(&self) -> bool {
        matches!(self, Outcome::Transferred(_))
    }
}

/// Mapping from relative path to outcome, kept for the lifetime of one run.
///
/// Successes survive across retry attempts so that a later attempt never
/// re-reads or re-stores a file. Error outcomes only reflect the attempt that
/// produced them: they are dropped when the next attempt begins.
#[derive(Debug, Default)]
pub struct Ledger {
    entries: BTreeMap<String, Outcome>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget error outcomes from a previous attempt.
    pub fn begin_attempt(&mut self) {
        self.entries.retain(|_, outcome| outcome.is_transferred());
    }

    pub fn record_transferred(&mut self, path: &str, duration: Duration) {
        self.entries
            .insert(path.to_string(), Outcome::Transferred(duration));
    }

    pub fn record_error(&mut self, path: &str, side: Side, error: io::Error) {
        self.entries
            .insert(path.to_string(), Outcome::Failed { side, error });
    }

    pub fn is_transferred(&self, path: &str) -> bool {
        self.entries.get(path).is_some_and(Outcome::is_transferred)
    }

    /// Snapshot of every path that already has a success outcome.
    pub fn transferred_paths(&self) -> HashSet<String> {
        self.entries
            .iter()
            .filter(|(_, outcome)| outcome.is_transferred())
            .map(|(path, _)| path.clone())
            .collect()
    }

    pub fn get(&self, path: &str) -> Option<&Outcome> {
        self.entries.get(path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of error outcomes on the given side.
    pub fn error_count(&self, side: Side) -> usize {
        self.entries
            .values()
            .filter(|outcome| matches!(outcome, Outcome::Failed { side: s, .. } if *s == side))
            .count()
    }

    pub fn has_errors(&self) -> bool {
        self.entries.values().any(|outcome| !outcome.is_transferred())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Outcome)> {
        self.entries.iter().map(|(path, outcome)| (path.as_str(), outcome))
    }
}

/// Tag of one row in the collected file list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FileTag {
    Transferred,
    SourceError,
    TargetError,
}

impl fmt::Display for FileTag {
    /// Short symbols as used in notification listings.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileTag::Transferred => write!(f, "="),
            FileTag::SourceError => write!(f, ">"),
            FileTag::TargetError => write!(f, "<"),
        }
    }
}

/// Info column of a collected file row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileInfo {
    Duration(Duration),
    Error(String),
}

impl fmt::Display for FileInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileInfo::Duration(d) => write!(f, "{:.3}s", d.as_secs_f64()),
            FileInfo::Error(msg) => write!(f, "{}", msg),
        }
    }
}

/// One row of the collected file list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileRecord {
    pub path: String,
    pub info: FileInfo,
    pub tag: FileTag,
}

/// Result of a job run, derived once from the ledger and never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobResult {
    /// Number of successfully transferred files
    pub files_cnt: usize,
    /// Number of files that could not be read
    pub src_error_cnt: usize,
    /// Number of files that could not be written
    pub tgt_error_cnt: usize,
    /// Per-file rows sorted by path; `None` if data collection is disabled
    pub file_list: Option<Vec<FileRecord>>,
}

impl JobResult {
    /// Build the result from a ledger.
    pub fn from_ledger(ledger: &Ledger, collect_data: bool) -> Self {
        let mut files_cnt = 0;
        let mut src_error_cnt = 0;
        let mut tgt_error_cnt = 0;
        let mut rows = Vec::new();

        for (path, outcome) in ledger.iter() {
            let (info, tag) = match outcome {
                Outcome::Transferred(duration) => {
                    files_cnt += 1;
                    (FileInfo::Duration(*duration), FileTag::Transferred)
                }
                Outcome::Failed { side, error } => {
                    let tag = match side {
                        Side::Source => {
                            src_error_cnt += 1;
                            FileTag::SourceError
                        }
                        Side::Target => {
                            tgt_error_cnt += 1;
                            FileTag::TargetError
                        }
                    };
                    (FileInfo::Error(first_line(error)), tag)
                }
            };
            if collect_data {
                rows.push(FileRecord {
                    path: path.to_string(),
                    info,
                    tag,
                });
            }
        }

        JobResult {
            files_cnt,
            src_error_cnt,
            tgt_error_cnt,
            file_list: collect_data.then_some(rows),
        }
    }

    pub fn has_errors(&self) -> bool {
        self.src_error_cnt > 0 || self.tgt_error_cnt > 0
    }

    pub fn exit_status(&self) -> ExitStatus {
        if self.has_errors() {
            ExitStatus::Errors
        } else {
            ExitStatus::Success
        }
    }
}

impl fmt::Display for JobResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} files transferred, {} source errors, {} target errors",
            self.files_cnt, self.src_error_cnt, self.tgt_error_cnt
        )
    }
}

/// Process exit status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExitStatus {
    Success,
    Errors,
    Failure,
    Config,
    CmdLine,
    Terminated,
    AlreadyRunning,
    NotReady,
}

impl ExitStatus {
    pub fn code(self) -> i32 {
        match self {
            ExitStatus::Success => 0,
            ExitStatus::Errors => 1,
            ExitStatus::Failure => 2,
            ExitStatus::Config => 3,
            ExitStatus::CmdLine => 4,
            ExitStatus::Terminated => 5,
            ExitStatus::AlreadyRunning => 6,
            ExitStatus::NotReady => 7,
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            ExitStatus::Success => "success",
            ExitStatus::Errors => "with errors",
            ExitStatus::Failure => "failure",
            ExitStatus::Config => "config error",
            ExitStatus::CmdLine => "cmd line syntax error",
            ExitStatus::Terminated => "terminated",
            ExitStatus::AlreadyRunning => "already running",
            ExitStatus::NotReady => "not ready",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_ledger() -> Ledger {
        let mut ledger = Ledger::new();
        ledger.record_transferred("a", Duration::from_secs(1));
        ledger.record_error("b", Side::Source, io::Error::other("permission denied"));
        ledger.record_error("c", Side::Target, io::Error::other("disk full\ndetails"));
        ledger
    }

    #[test]
    fn test_result_aggregation_with_data_collection() {
        let result = JobResult::from_ledger(&sample_ledger(), true);

        assert_eq!(result.files_cnt, 1);
        assert_eq!(result.src_error_cnt, 1);
        assert_eq!(result.tgt_error_cnt, 1);

        let rows = result.file_list.expect("file list should be collected");
        assert_eq!(
            rows,
            vec![
                FileRecord {
                    path: "a".into(),
                    info: FileInfo::Duration(Duration::from_secs(1)),
                    tag: FileTag::Transferred,
                },
                FileRecord {
                    path: "b".into(),
                    info: FileInfo::Error("permission denied".into()),
                    tag: FileTag::SourceError,
                },
                FileRecord {
                    path: "c".into(),
                    info: FileInfo::Error("disk full".into()),
                    tag: FileTag::TargetError,
                },
            ]
        );
    }

    #[test]
    fn test_result_without_data_collection() {
        let result = JobResult::from_ledger(&sample_ledger(), false);
        assert_eq!((result.files_cnt, result.src_error_cnt, result.tgt_error_cnt), (1, 1, 1));
        assert!(result.file_list.is_none());
        assert_eq!(result.exit_status(), ExitStatus::Errors);
    }

    #[test]
    fn test_begin_attempt_keeps_only_successes() {
        let mut ledger = sample_ledger();
        ledger.begin_attempt();

        assert_eq!(ledger.len(), 1);
        assert!(ledger.is_transferred("a"));
        assert!(!ledger.has_errors());
        assert_eq!(ledger.transferred_paths(), HashSet::from(["a".to_string()]));
    }

    #[test]
    fn test_error_overwrites_previous_error() {
        let mut ledger = Ledger::new();
        ledger.record_error("x", Side::Source, io::Error::other("first"));
        ledger.record_error("x", Side::Target, io::Error::other("second"));

        assert_eq!(ledger.error_count(Side::Source), 0);
        assert_eq!(ledger.error_count(Side::Target), 1);
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(ExitStatus::Success.code(), 0);
        assert_eq!(ExitStatus::Errors.code(), 1);
        assert_eq!(ExitStatus::Terminated.code(), 5);
        assert_eq!(ExitStatus::NotReady.description(), "not ready");
    }

    #[test]
    fn test_tag_symbols() {
        assert_eq!(FileTag::Transferred.to_string(), "=");
        assert_eq!(FileTag::SourceError.to_string(), ">");
        assert_eq!(FileTag::TargetError.to_string(), "<");
    }
}
