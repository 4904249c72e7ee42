//! Local filesystem endpoint.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::Path;

use super::{Endpoint, ReadStream, WriteStream};

/// Endpoint bound directly to the local filesystem. Release is a no-op.
#[derive(Debug, Default)]
pub struct LocalEndpoint;

impl LocalEndpoint {
    pub fn new() -> Self {
        LocalEndpoint
    }
}

struct LocalWriter {
    file: File,
}

impl Write for LocalWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl WriteStream for LocalWriter {
    fn commit(mut self: Box<Self>) -> io::Result<()> {
        self.file.flush()?;
        self.file.sync_all()
    }
}

impl Endpoint for LocalEndpoint {
    fn describe(&self) -> String {
        "LOCAL".to_string()
    }

    fn join(&self, base: &str, name: &str) -> String {
        Path::new(base).join(name).to_string_lossy().into_owned()
    }

    fn basename(&self, path: &str) -> String {
        Path::new(path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    fn dirname(&self, path: &str) -> String {
        Path::new(path)
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    fn open_read(&mut self, path: &str) -> io::Result<ReadStream> {
        Ok(Box::new(File::open(path)?))
    }

    fn open_write(&mut self, path: &str) -> io::Result<Box<dyn WriteStream>> {
        Ok(Box::new(LocalWriter {
            file: File::create(path)?,
        }))
    }

    fn remove(&mut self, path: &str) -> io::Result<()> {
        fs::remove_file(path)
    }

    fn list(&mut self, path: &str) -> io::Result<Vec<String>> {
        fs::read_dir(path)?
            .map(|entry| entry.map(|e| e.file_name().to_string_lossy().into_owned()))
            .collect()
    }

    /// Symlinks are reported as neither directories nor files, so the walker
    /// never leaves the tree through a link.
    fn is_dir(&mut self, path: &str) -> bool {
        fs::symlink_metadata(path).is_ok_and(|m| m.is_dir())
    }

    fn is_file(&mut self, path: &str) -> bool {
        fs::symlink_metadata(path).is_ok_and(|m| m.is_file())
    }

    fn exists(&mut self, path: &str) -> bool {
        fs::symlink_metadata(path).is_ok()
    }

    fn make_dirs(&mut self, path: &str) -> io::Result<()> {
        if path.is_empty() {
            return Ok(());
        }
        fs::create_dir_all(path)
    }

    fn rename(&mut self, from: &str, to: &str) -> io::Result<()> {
        fs::rename(from, to)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn test_write_then_read() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let mut ep = LocalEndpoint::new();
        let base = temp_dir.path().to_string_lossy().into_owned();
        let dir = ep.join(&base, "nested/deeper");
        let file = ep.join(&dir, "data.bin");

        ep.make_dirs(&dir).expect("Failed to create dirs");
        let mut writer = ep.open_write(&file).expect("Failed to open for write");
        writer.write_all(b"payload").expect("Failed to write");
        writer.commit().expect("Failed to commit");

        let mut content = String::new();
        ep.open_read(&file)
            .expect("Failed to open for read")
            .read_to_string(&mut content)
            .expect("Failed to read");
        assert_eq!(content, "payload");
        assert!(ep.is_file(&file));
        assert!(ep.is_dir(&dir));
        assert!(!ep.is_dir(&file));
        assert_eq!(ep.basename(&file), "data.bin");
        assert_eq!(ep.dirname(&file), dir);
    }

    #[test]
    fn test_list_rename_remove() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let mut ep = LocalEndpoint::new();
        let base = temp_dir.path().to_string_lossy().into_owned();
        fs::write(temp_dir.path().join("b"), "b").expect("Failed to write b");
        fs::write(temp_dir.path().join("a"), "a").expect("Failed to write a");

        let mut names = ep.list(&base).expect("Failed to list");
        names.sort();
        assert_eq!(names, vec!["a", "b"]);

        ep.rename(&ep.join(&base, "a"), &ep.join(&base, "c"))
            .expect("Failed to rename");
        ep.remove(&ep.join(&base, "b")).expect("Failed to remove");
        assert_eq!(ep.list(&base).expect("Failed to list"), vec!["c"]);
        assert!(!ep.exists(&ep.join(&base, "a")));
    }

    #[test]
    fn test_list_missing_directory_fails() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let mut ep = LocalEndpoint::new();
        let missing = temp_dir.path().join("missing");
        assert!(ep.list(&missing.to_string_lossy()).is_err());
    }
}
