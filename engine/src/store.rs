//! Target side: atomic store.
//!
//! `Target::store` streams a reader to the target in fixed-size chunks. With
//! a temp policy the bytes go to a temporary path first and are renamed onto
//! the final path, so the final path never shows a partially written file.

use std::io::{self, Read, Write};

use tracing::{debug, error};

use crate::config::{TargetConfig, TempPolicy};
use crate::endpoint::{normalize_base, Endpoint, ReadStream};

/// Size of one read/write chunk.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Target endpoint together with its temp-file policy.
pub struct Target {
    endpoint: Box<dyn Endpoint>,
    base: String,
    temp: TempPolicy,
}

impl Target {
    pub fn new(endpoint: Box<dyn Endpoint>, config: &TargetConfig) -> Self {
        debug!(temp = ?config.temp, "target settings");
        Target {
            endpoint,
            base: normalize_base(&config.location.path),
            temp: config.temp.clone(),
        }
    }

    pub fn describe(&self) -> String {
        self.endpoint.describe()
    }

    /// Temporary path for `full_path`, or `None` to write in place.
    ///
    /// The subdirectory policy creates its directory under the target base
    /// path when missing.
    pub fn temp_path(&mut self, full_path: &str) -> io::Result<Option<String>> {
        let name = self.endpoint.basename(full_path);
        let path = match &self.temp {
            TempPolicy::None => return Ok(None),
            TempPolicy::DotPrefix => {
                let dir = self.endpoint.dirname(full_path);
                self.endpoint.join(&dir, &format!(".{}", name))
            }
            TempPolicy::Extension(ext) => format!("{}{}", full_path, ext),
            TempPolicy::Subdirectory(sub) => {
                let dir = self.endpoint.join(&self.base, sub);
                self.endpoint.make_dirs(&dir)?;
                self.endpoint.join(&dir, &name)
            }
        };
        Ok(Some(path))
    }

    /// Store one file under `relative_path`.
    ///
    /// The parent directories are created as needed and an existing file at
    /// the final path is replaced. The reader is consumed and closed.
    ///
    /// # Returns
    /// Number of bytes written.
    ///
    /// # Errors
    /// Any failure while preparing, writing or renaming. The temporary file,
    /// or the partial final file when no temp policy is set, is removed
    /// before the error is returned.
    pub fn store(&mut self, relative_path: &str, reader: ReadStream) -> io::Result<u64> {
        let full_path = self.endpoint.join(&self.base, relative_path);
        debug!(path = %full_path, "storing");
        let result = self.store_at(&full_path, reader);
        if let Err(e) = &result {
            error!(path = %relative_path, error = %e, "Target - file");
        }
        result
    }

    fn store_at(&mut self, full_path: &str, reader: ReadStream) -> io::Result<u64> {
        let parent = self.endpoint.dirname(full_path);
        self.endpoint.make_dirs(&parent)?;
        let temp_path = self.temp_path(full_path)?;
        if self.endpoint.exists(full_path) {
            self.endpoint.remove(full_path)?;
        }

        let write_path = temp_path.as_deref().unwrap_or(full_path);
        let result = self.copy(write_path, reader).and_then(|bytes| {
            if let Some(temp) = &temp_path {
                self.endpoint.rename(temp, full_path)?;
            }
            Ok(bytes)
        });

        if result.is_err() && self.endpoint.exists(write_path) {
            if let Err(e) = self.endpoint.remove(write_path) {
                debug!(path = %write_path, error = %e, "could not remove incomplete file");
            }
        }
        result
    }

    fn copy(&mut self, path: &str, mut reader: ReadStream) -> io::Result<u64> {
        let mut writer = self.endpoint.open_write(path)?;
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut total = 0u64;
        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            writer.write_all(&buf[..n])?;
            total += n as u64;
        }
        drop(reader);
        writer.commit()?;
        Ok(total)
    }
}
