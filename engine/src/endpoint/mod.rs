//! Endpoint capability model.
//!
//! An `Endpoint` is the minimal operation set a storage backend provides to
//! the walker and the atomic store: path manipulation, open for read/write,
//! remove, list, stat-like tests, recursive mkdir and rename. Local disk, FTP,
//! FTPS and SFTP all implement it, and the engine never talks to a transport
//! directly.
//!
//! Paths crossing this boundary are strings. Remote backends use `/` as
//! separator; the local backend uses the platform's convention for joins.
//! Connections are released when the endpoint is dropped.

use std::io::{self, Read, Write};

use crate::config::{Location, Protocol};
use crate::error::EngineError;

#[cfg(test)]
pub(crate) mod faulty;
pub mod ftp;
pub mod local;
pub mod sftp;

pub use ftp::FtpEndpoint;
pub use local::LocalEndpoint;
pub use sftp::SftpEndpoint;

/// Readable byte stream of a source file. Dropping it closes the file.
pub type ReadStream = Box<dyn Read>;

/// Writable byte stream of a target file.
///
/// `commit` flushes and closes the stream, reporting failures that a plain
/// drop would hide (e.g. the final server reply of an FTP upload).
pub trait WriteStream: Write {
    fn commit(self: Box<Self>) -> io::Result<()>;
}

/// Operations a storage backend must support.
pub trait Endpoint {
    /// Short description for logs, e.g. `SFTP example.com:22`.
    fn describe(&self) -> String;

    fn join(&self, base: &str, name: &str) -> String {
        posix::join(base, name)
    }

    fn basename(&self, path: &str) -> String {
        posix::basename(path).to_string()
    }

    fn dirname(&self, path: &str) -> String {
        posix::dirname(path).to_string()
    }

    fn open_read(&mut self, path: &str) -> io::Result<ReadStream>;

    fn open_write(&mut self, path: &str) -> io::Result<Box<dyn WriteStream>>;

    fn remove(&mut self, path: &str) -> io::Result<()>;

    /// Names (not paths) of the direct children of a directory.
    fn list(&mut self, path: &str) -> io::Result<Vec<String>>;

    fn is_dir(&mut self, path: &str) -> bool;

    fn is_file(&mut self, path: &str) -> bool;

    fn exists(&mut self, path: &str) -> bool {
        self.is_file(path) || self.is_dir(path)
    }

    /// Create a directory and all missing parents; existing ones are fine.
    fn make_dirs(&mut self, path: &str) -> io::Result<()>;

    fn rename(&mut self, from: &str, to: &str) -> io::Result<()>;
}

/// Which side of a job an endpoint is opened for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Source,
    Target,
}

/// Builds endpoints from configuration.
///
/// The orchestrator only sees this trait, so tests can substitute endpoints
/// with injected faults.
pub trait EndpointFactory {
    fn connect(&self, role: Role, location: &Location) -> Result<Box<dyn Endpoint>, EngineError>;
}

/// Factory dispatching on the configured protocol.
#[derive(Debug, Default, Clone, Copy)]
pub struct Connector;

impl EndpointFactory for Connector {
    fn connect(&self, _role: Role, location: &Location) -> Result<Box<dyn Endpoint>, EngineError> {
        match &location.server {
            None => Ok(Box::new(LocalEndpoint::new())),
            Some(server) => match server.protocol {
                Protocol::Ftp => Ok(Box::new(FtpEndpoint::connect(server, false)?)),
                Protocol::Ftps => Ok(Box::new(FtpEndpoint::connect(server, true)?)),
                Protocol::Sftp => Ok(Box::new(SftpEndpoint::connect(server)?)),
            },
        }
    }
}

/// Strip trailing separators from a configured base path, keeping a bare root.
pub fn normalize_base(path: &str) -> String {
    let trimmed = path.trim_end_matches(['/', '\\']);
    if trimmed.is_empty() && !path.is_empty() {
        path[..1].to_string()
    } else {
        trimmed.to_string()
    }
}

/// `/`-separated path helpers shared by the remote backends.
pub mod posix {
    pub fn join(base: &str, name: &str) -> String {
        if name.starts_with('/') || base.is_empty() {
            name.to_string()
        } else if base.ends_with('/') {
            format!("{}{}", base, name)
        } else {
            format!("{}/{}", base, name)
        }
    }

    pub fn basename(path: &str) -> &str {
        match path.rfind('/') {
            Some(idx) => &path[idx + 1..],
            None => path,
        }
    }

    pub fn dirname(path: &str) -> &str {
        match path.rfind('/') {
            Some(0) => "/",
            Some(idx) => &path[..idx],
            None => "",
        }
    }

    /// Every ancestor prefix of `path`, shortest first, including `path`.
    pub fn prefixes(path: &str) -> Vec<String> {
        let mut out = Vec::new();
        let mut current = if path.starts_with('/') {
            String::from("/")
        } else {
            String::new()
        };
        for part in path.split('/').filter(|p| !p.is_empty()) {
            current = join(&current, part);
            out.push(current.clone());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_posix_join() {
        assert_eq!(posix::join("/data", "a.txt"), "/data/a.txt");
        assert_eq!(posix::join("/", "a.txt"), "/a.txt");
        assert_eq!(posix::join("", "a.txt"), "a.txt");
        assert_eq!(posix::join("data/in", "sub/b.txt"), "data/in/sub/b.txt");
    }

    #[test]
    fn test_posix_basename_dirname() {
        assert_eq!(posix::basename("/data/in/a.txt"), "a.txt");
        assert_eq!(posix::dirname("/data/in/a.txt"), "/data/in");
        assert_eq!(posix::dirname("/a.txt"), "/");
        assert_eq!(posix::dirname("a.txt"), "");
    }

    #[test]
    fn test_posix_prefixes() {
        assert_eq!(posix::prefixes("/srv/up/x"), vec!["/srv", "/srv/up", "/srv/up/x"]);
        assert_eq!(posix::prefixes("up/x"), vec!["up", "up/x"]);
    }

    #[test]
    fn test_normalize_base() {
        assert_eq!(normalize_base("/data/in///"), "/data/in");
        assert_eq!(normalize_base("/"), "/");
        assert_eq!(normalize_base("relative/"), "relative");
    }
}
