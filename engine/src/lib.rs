//! # Transfer Engine - Unattended File Transfer Library
//!
//! A headless engine that moves files between local directories, FTP/FTPS
//! servers and SFTP servers, one configured job at a time.
//! Designed as the foundation for command line and scheduler front ends.
//!
//! ## Overview
//!
//! A job selects files on a source endpoint with glob patterns and stores
//! them on a target endpoint. It features:
//! - Uniform endpoint capabilities for Local, FTP, FTPS and SFTP
//! - Atomic store through temporary names
//! - Per-file outcome ledger; a retried attempt never re-reads a stored file
//! - Retries with exponential backoff
//! - Single-instance lock and ready-file gate
//! - Progress and notification callbacks (decoupled from any UI)
//!
//! ## Basic Usage
//!
//! ```no_run
//! use engine::{run, AppConfig, RunContext};
//! use std::path::Path;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let app = AppConfig::load(Path::new("/etc/filetransfer/filetransfer.toml"))?;
//! let job = app.load_job("nightly")?;
//!
//! match run(&job, RunContext::new()) {
//!     Ok((result, status)) => println!("{} ({})", result, status.description()),
//!     Err(failure) => eprintln!("{}", failure),
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - **config**: Job, endpoint and retry configuration
//! - **loader**: TOML application and job files
//! - **endpoint**: Endpoint capability trait and its backends
//! - **walker**: Source traversal and pattern matching
//! - **store**: Atomic store into the target
//! - **job**: Attempt and run orchestration
//! - **retry**: Backoff and retry controller
//! - **instance**: Single-instance lock
//! - **model**: Ledger, job result and exit statuses
//! - **error**: Error types
//! - **logging**: Deferred log sink
//! - **progress** / **report**: Callbacks for front ends
//! - **hostkeys**: SFTP host key maintenance
//! - **shutdown**: Termination flag

pub mod config;
pub mod endpoint;
pub mod error;
pub mod hostkeys;
pub mod instance;
pub mod job;
pub mod loader;
pub mod logging;
pub mod model;
pub mod progress;
pub mod report;
pub mod retry;
pub mod shutdown;
pub mod store;
pub mod walker;

// Re-export main types and functions
pub use config::{
    JobConfig, Location, LockConfig, Protocol, RetryConfig, ServerConfig, SourceConfig,
    TargetConfig, TempPolicy,
};
pub use endpoint::{Connector, Endpoint, EndpointFactory, Role};
pub use error::{EngineError, RunFailure};
pub use job::{run, transfer, transfer_with, RunContext};
pub use loader::{AppConfig, LoggingSettings};
pub use model::{ExitStatus, FileRecord, FileTag, JobResult};
pub use progress::ProgressCallback;
pub use report::{ErrorClass, JobReport, Notifier};
pub use shutdown::Shutdown;
