//! Local endpoint with injectable failures, for tests.

use std::cell::RefCell;
use std::io::{self, Write};
use std::rc::Rc;

use super::{Endpoint, LocalEndpoint, ReadStream, WriteStream};

/// Failures keyed by path suffix.
#[derive(Debug, Default, Clone)]
pub(crate) struct Faults {
    pub list: Vec<(String, io::ErrorKind)>,
    pub open_read: Vec<String>,
    pub open_write: Vec<String>,
    /// Writes after the first chunk fail, and so does commit
    pub write: Vec<String>,
    pub rename: Vec<String>,
}

fn hit(rules: &[String], path: &str) -> bool {
    rules.iter().any(|suffix| path.ends_with(suffix.as_str()))
}

/// Operation log shared between a test and the endpoints it created.
pub(crate) type Calls = Rc<RefCell<Vec<String>>>;

pub(crate) struct FaultyEndpoint {
    inner: LocalEndpoint,
    faults: Faults,
    calls: Calls,
}

impl FaultyEndpoint {
    pub fn new(faults: Faults, calls: Calls) -> Self {
        FaultyEndpoint {
            inner: LocalEndpoint::new(),
            faults,
            calls,
        }
    }

    fn record(&self, op: &str, path: &str) {
        self.calls.borrow_mut().push(format!("{} {}", op, path));
    }
}

struct FailingWriter {
    inner: Box<dyn WriteStream>,
    writes: usize,
}

impl Write for FailingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.writes += 1;
        if self.writes > 1 {
            return Err(io::Error::other("disk full"));
        }
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl WriteStream for FailingWriter {
    fn commit(mut self: Box<Self>) -> io::Result<()> {
        self.inner.flush()?;
        Err(io::Error::other("disk full"))
    }
}

impl Endpoint for FaultyEndpoint {
    fn describe(&self) -> String {
        "FAULTY".to_string()
    }

    fn join(&self, base: &str, name: &str) -> String {
        self.inner.join(base, name)
    }

    fn basename(&self, path: &str) -> String {
        self.inner.basename(path)
    }

    fn dirname(&self, path: &str) -> String {
        self.inner.dirname(path)
    }

    fn open_read(&mut self, path: &str) -> io::Result<ReadStream> {
        self.record("read", path);
        if hit(&self.faults.open_read, path) {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "permission denied"));
        }
        self.inner.open_read(path)
    }

    fn open_write(&mut self, path: &str) -> io::Result<Box<dyn WriteStream>> {
        self.record("write", path);
        if hit(&self.faults.open_write, path) {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "permission denied"));
        }
        let inner = self.inner.open_write(path)?;
        if hit(&self.faults.write, path) {
            return Ok(Box::new(FailingWriter { inner, writes: 0 }));
        }
        Ok(inner)
    }

    fn remove(&mut self, path: &str) -> io::Result<()> {
        self.record("remove", path);
        self.inner.remove(path)
    }

    fn list(&mut self, path: &str) -> io::Result<Vec<String>> {
        self.record("list", path);
        if let Some((_, kind)) = self
            .faults
            .list
            .iter()
            .find(|(suffix, _)| path.ends_with(suffix.as_str()))
        {
            return Err(io::Error::new(*kind, "listing failed"));
        }
        self.inner.list(path)
    }

    fn is_dir(&mut self, path: &str) -> bool {
        self.inner.is_dir(path)
    }

    fn is_file(&mut self, path: &str) -> bool {
        self.inner.is_file(path)
    }

    fn exists(&mut self, path: &str) -> bool {
        self.inner.exists(path)
    }

    fn make_dirs(&mut self, path: &str) -> io::Result<()> {
        self.inner.make_dirs(path)
    }

    fn rename(&mut self, from: &str, to: &str) -> io::Result<()> {
        self.record("rename", to);
        if hit(&self.faults.rename, to) {
            return Err(io::Error::other("rename refused"));
        }
        self.inner.rename(from, to)
    }
}
