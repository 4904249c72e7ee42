//! Log setup with a deferred sink.
//!
//! Records are queued in memory until the run holds its single-instance lock
//! and calls [`LogHandle::activate`]. Only then is the log file opened and the
//! queue flushed, so a second process that loses the lock race never writes
//! into the log of the running one.

use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Local};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

use crate::error::EngineError;
use crate::loader::LoggingSettings;

/// Records kept while buffering; older ones are dropped first.
pub const DEFAULT_CAPACITY: usize = 10_000;

const TIMESTAMP_FORMAT: &str = "%Y%m%d-%H%M%S";

/// Where records go once the sink is live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogTarget {
    Stderr,
    File(PathBuf),
}

/// Log file for one run.
///
/// Without a log directory the target is stderr. With `use_subdirs` the file
/// is `<log_dir>/<job_id>/<timestamp>.log`, otherwise
/// `<log_dir>/<job_id>_<timestamp>.log`.
pub fn log_target(settings: &LoggingSettings, job_id: &str, start: DateTime<Local>) -> LogTarget {
    let Some(dir) = &settings.log_dir else {
        return LogTarget::Stderr;
    };
    let stamp = start.format(TIMESTAMP_FORMAT);
    let path = if settings.use_subdirs {
        dir.join(job_id).join(format!("{}.log", stamp))
    } else {
        dir.join(format!("{}_{}.log", job_id, stamp))
    };
    LogTarget::File(path)
}

enum Live {
    Stderr,
    File(File),
}

impl Live {
    fn write_record(&mut self, record: &[u8]) -> io::Result<()> {
        match self {
            Live::Stderr => io::stderr().write_all(record),
            Live::File(file) => file.write_all(record),
        }
    }
}

enum State {
    Buffering {
        queue: VecDeque<Vec<u8>>,
        dropped: usize,
    },
    Live(Live),
    Disabled,
}

struct Inner {
    state: State,
    target: LogTarget,
    capacity: usize,
    /// Records the live destination refused
    lost: usize,
}

impl Inner {
    fn push(&mut self, record: Vec<u8>) {
        match &mut self.state {
            State::Buffering { queue, dropped } => {
                if queue.len() == self.capacity {
                    queue.pop_front();
                    *dropped += 1;
                }
                queue.push_back(record);
            }
            State::Live(live) => {
                if live.write_record(&record).is_err() {
                    self.lost += 1;
                }
            }
            State::Disabled => {}
        }
    }
}

fn open_log_file(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

/// `MakeWriter` that buffers records until activated.
#[derive(Clone)]
pub struct DeferredSink {
    inner: Arc<Mutex<Inner>>,
}

impl DeferredSink {
    pub fn new(target: LogTarget, capacity: usize) -> Self {
        DeferredSink {
            inner: Arc::new(Mutex::new(Inner {
                state: State::Buffering {
                    queue: VecDeque::new(),
                    dropped: 0,
                },
                target,
                capacity: capacity.max(1),
                lost: 0,
            })),
        }
    }

    pub fn handle(&self) -> LogHandle {
        LogHandle {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// One formatted record; handed to the sink when dropped.
pub struct RecordWriter {
    inner: Arc<Mutex<Inner>>,
    buf: Vec<u8>,
}

impl Write for RecordWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for RecordWriter {
    fn drop(&mut self) {
        if self.buf.is_empty() {
            return;
        }
        if let Ok(mut inner) = self.inner.lock() {
            inner.push(std::mem::take(&mut self.buf));
        }
    }
}

impl<'a> MakeWriter<'a> for DeferredSink {
    type Writer = RecordWriter;

    fn make_writer(&'a self) -> Self::Writer {
        RecordWriter {
            inner: Arc::clone(&self.inner),
            buf: Vec::new(),
        }
    }
}

/// Control side of a [`DeferredSink`].
#[derive(Clone)]
pub struct LogHandle {
    inner: Arc<Mutex<Inner>>,
}

impl LogHandle {
    /// Open the destination and flush queued records. Calling it again is a
    /// no-op.
    ///
    /// # Errors
    /// The log file cannot be opened. The sink then writes to stderr instead,
    /// so no record is lost.
    pub fn activate(&self) -> io::Result<()> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| io::Error::other("log sink poisoned"))?;
        let (queue, dropped) = match std::mem::replace(&mut inner.state, State::Disabled) {
            State::Buffering { queue, dropped } => (queue, dropped),
            other => {
                inner.state = other;
                return Ok(());
            }
        };
        let (mut live, result) = match &inner.target {
            LogTarget::Stderr => (Live::Stderr, Ok(())),
            LogTarget::File(path) => match open_log_file(path) {
                Ok(file) => (Live::File(file), Ok(())),
                Err(e) => (Live::Stderr, Err(e)),
            },
        };
        let mut lost = 0;
        if dropped > 0 {
            let notice = format!("[{} early log records dropped]\n", dropped);
            if live.write_record(notice.as_bytes()).is_err() {
                lost += 1;
            }
        }
        for record in queue {
            if live.write_record(&record).is_err() {
                lost += 1;
            }
        }
        inner.lost += lost;
        inner.state = State::Live(live);
        result
    }

    /// Discard queued records and ignore everything logged from now on.
    pub fn disable(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.state = State::Disabled;
        }
    }

    pub fn is_active(&self) -> bool {
        self.inner
            .lock()
            .map(|inner| matches!(inner.state, State::Live(_)))
            .unwrap_or(false)
    }

    /// Number of records the destination failed to accept.
    pub fn lost_records(&self) -> usize {
        self.inner.lock().map(|inner| inner.lost).unwrap_or(0)
    }

    pub fn target(&self) -> Option<LogTarget> {
        self.inner.lock().ok().map(|inner| inner.target.clone())
    }
}

/// Install the global `tracing` subscriber writing through a deferred sink.
///
/// `RUST_LOG` takes precedence over `level`.
pub fn init(level: &str, target: LogTarget) -> Result<LogHandle, EngineError> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .map_err(|e| EngineError::config(format!("Invalid log level \"{}\": {}", level, e)))?;
    let sink = DeferredSink::new(target, DEFAULT_CAPACITY);
    let handle = sink.handle();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(sink)
        .with_ansi(false)
        .with_target(false)
        .try_init()
        .map_err(|e| EngineError::config(format!("Logging already initialized: {}", e)))?;
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn emit(sink: &DeferredSink, text: &str) {
        let mut writer = sink.make_writer();
        writer.write_all(text.as_bytes()).expect("Failed to write record");
    }

    #[test]
    fn test_records_are_held_until_activation() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = temp_dir.path().join("logs").join("job.log");
        let sink = DeferredSink::new(LogTarget::File(path.clone()), 10);
        let handle = sink.handle();

        emit(&sink, "first\n");
        assert!(!path.exists());
        assert!(!handle.is_active());

        handle.activate().expect("Failed to activate");
        emit(&sink, "second\n");
        assert!(handle.is_active());
        assert_eq!(fs::read_to_string(&path).expect("read log"), "first\nsecond\n");
    }

    #[test]
    fn test_buffer_drops_oldest_records() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = temp_dir.path().join("job.log");
        let sink = DeferredSink::new(LogTarget::File(path.clone()), 2);
        for i in 0..4 {
            emit(&sink, &format!("r{}\n", i));
        }
        sink.handle().activate().expect("Failed to activate");
        assert_eq!(
            fs::read_to_string(&path).expect("read log"),
            "[2 early log records dropped]\nr2\nr3\n"
        );
    }

    #[test]
    fn test_disabled_sink_writes_nothing() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = temp_dir.path().join("job.log");
        let sink = DeferredSink::new(LogTarget::File(path.clone()), 10);
        emit(&sink, "queued\n");
        let handle = sink.handle();
        handle.disable();
        handle.activate().expect("activate after disable is a no-op");
        emit(&sink, "ignored\n");
        assert!(!path.exists());
    }

    #[test]
    fn test_failed_writes_are_counted_not_raised() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = temp_dir.path().join("job.log");
        let sink = DeferredSink::new(LogTarget::File(path.clone()), 10);
        let handle = sink.handle();
        handle.activate().expect("Failed to activate");
        emit(&sink, "kept\n");
        assert_eq!(handle.lost_records(), 0);

        let read_only = File::open(&path).expect("Failed to reopen log");
        sink.inner.lock().expect("sink lock").state = State::Live(Live::File(read_only));
        emit(&sink, "refused\n");
        emit(&sink, "refused again\n");

        assert_eq!(handle.lost_records(), 2);
        assert_eq!(fs::read_to_string(&path).expect("read log"), "kept\n");
    }

    #[test]
    fn test_log_target_layouts() {
        let start = Local
            .with_ymd_and_hms(2024, 3, 9, 7, 5, 1)
            .single()
            .expect("valid time");
        let mut settings = LoggingSettings {
            log_dir: Some(PathBuf::from("/var/log/ft")),
            ..LoggingSettings::default()
        };
        assert_eq!(
            log_target(&settings, "job1", start),
            LogTarget::File(PathBuf::from("/var/log/ft/job1/20240309-070501.log"))
        );
        settings.use_subdirs = false;
        assert_eq!(
            log_target(&settings, "job1", start),
            LogTarget::File(PathBuf::from("/var/log/ft/job1_20240309-070501.log"))
        );
        settings.log_dir = None;
        assert_eq!(log_target(&settings, "job1", start), LogTarget::Stderr);
    }
}
