//! Source side: pattern matching and the file walk.
//!
//! The walk is a pull-based depth-first traversal of the source tree. Entries
//! are visited in name order. Each matching file is yielded already opened
//! for reading, or as a discovery error if it cannot be opened. A directory
//! that cannot be listed becomes a discovery error for that directory and the
//! walk continues with its siblings.

use std::io;

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use tracing::{debug, error, warn};

use crate::config::SourceConfig;
use crate::endpoint::{normalize_base, Endpoint, ReadStream};
use crate::error::{is_connection_lost, EngineError};

/// Compiled include or exclude patterns.
///
/// A pattern starting with `/` matches only directly under the base path.
/// Any other pattern matches directly under the base path or one directory
/// level below it. `*` never crosses a `/`.
#[derive(Debug, Clone)]
pub struct PatternSet {
    set: GlobSet,
}

impl PatternSet {
    pub fn new(patterns: &[String]) -> Result<Self, EngineError> {
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            for expanded in expand_pattern(pattern) {
                let glob = GlobBuilder::new(&expanded)
                    .literal_separator(true)
                    .build()
                    .map_err(|e| {
                        EngineError::config(format!("Invalid pattern \"{}\": {}", pattern, e))
                    })?;
                builder.add(glob);
            }
        }
        let set = builder
            .build()
            .map_err(|e| EngineError::config(format!("Invalid patterns: {}", e)))?;
        Ok(PatternSet { set })
    }

    /// Test a `/`-separated path relative to the base path.
    pub fn is_match(&self, relative_path: &str) -> bool {
        self.set.is_match(relative_path)
    }
}

fn expand_pattern(pattern: &str) -> Vec<String> {
    match pattern.strip_prefix('/') {
        Some(rooted) => vec![rooted.to_string()],
        None => vec![pattern.to_string(), format!("*/{}", pattern)],
    }
}

/// One item produced by the walk.
pub enum FileEntry {
    /// A selected file, opened for reading
    Open { path: String, reader: ReadStream },
    /// A file or directory that could not be read
    Error { path: String, error: io::Error },
}

impl FileEntry {
    pub fn path(&self) -> &str {
        match self {
            FileEntry::Open { path, .. } | FileEntry::Error { path, .. } => path,
        }
    }
}

/// Source endpoint together with its selection settings.
pub struct Source {
    endpoint: Box<dyn Endpoint>,
    base: String,
    include: PatternSet,
    exclude: PatternSet,
    recursive: bool,
    delete: bool,
}

impl Source {
    pub fn new(endpoint: Box<dyn Endpoint>, config: &SourceConfig) -> Result<Self, EngineError> {
        debug!(
            recursive = config.recursive,
            delete = config.delete,
            "source settings"
        );
        Ok(Source {
            endpoint,
            base: normalize_base(&config.location.path),
            include: PatternSet::new(&config.files)?,
            exclude: PatternSet::new(&config.ignore)?,
            recursive: config.recursive,
            delete: config.delete,
        })
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn describe(&self) -> String {
        self.endpoint.describe()
    }

    /// True if `relative_path` is selected by the include and exclude sets.
    pub fn selects(&self, relative_path: &str) -> bool {
        self.include.is_match(relative_path) && !self.exclude.is_match(relative_path)
    }

    /// True if a regular file `name` exists directly under the base path.
    pub fn has_file(&mut self, name: &str) -> bool {
        let path = self.endpoint.join(&self.base, name);
        self.endpoint.is_file(&path)
    }

    /// Remove a file directly under the base path.
    pub fn remove_file(&mut self, name: &str) -> io::Result<()> {
        let path = self.endpoint.join(&self.base, name);
        self.endpoint.remove(&path)
    }

    /// Start a walk over the source tree.
    ///
    /// Files for which `skip` returns true are passed over without being
    /// opened. The iterator yields `Err` only for failures that end the walk:
    /// the base directory cannot be listed, or the connection was lost.
    pub fn walk<F>(&mut self, skip: F) -> FileWalk<'_, F>
    where
        F: FnMut(&str) -> bool,
    {
        FileWalk {
            source: self,
            skip,
            stack: Vec::new(),
            started: false,
            finished: false,
        }
    }
}

struct Frame {
    dir: String,
    relative: String,
    names: std::vec::IntoIter<String>,
}

/// Iterator over the entries of one walk. See [`Source::walk`].
pub struct FileWalk<'a, F> {
    source: &'a mut Source,
    skip: F,
    stack: Vec<Frame>,
    started: bool,
    finished: bool,
}

impl<F> FileWalk<'_, F> {
    fn list_sorted(&mut self, dir: &str) -> io::Result<std::vec::IntoIter<String>> {
        let mut names = self.source.endpoint.list(dir)?;
        names.sort();
        Ok(names.into_iter())
    }

    /// Called once a yielded file has been stored. Removes the source file
    /// when delete-after-read is on; a failed removal is only logged.
    pub fn complete(&mut self, relative_path: &str) {
        if !self.source.delete {
            return;
        }
        let path = self.source.endpoint.join(&self.source.base, relative_path);
        match self.source.endpoint.remove(&path) {
            Ok(()) => debug!(path = %relative_path, "source file removed"),
            Err(e) => warn!(path = %relative_path, error = %e, "could not remove source file"),
        }
    }
}

impl<F> Iterator for FileWalk<'_, F>
where
    F: FnMut(&str) -> bool,
{
    type Item = io::Result<FileEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        if !self.started {
            self.started = true;
            let base = self.source.base.clone();
            match self.list_sorted(&base) {
                Ok(names) => self.stack.push(Frame {
                    dir: base,
                    relative: String::new(),
                    names,
                }),
                Err(e) => {
                    self.finished = true;
                    return Some(Err(e));
                }
            }
        }

        loop {
            let (path, relative) = {
                let frame = self.stack.last_mut()?;
                match frame.names.next() {
                    Some(name) => {
                        let relative = if frame.relative.is_empty() {
                            name.clone()
                        } else {
                            format!("{}/{}", frame.relative, name)
                        };
                        (self.source.endpoint.join(&frame.dir, &name), relative)
                    }
                    None => {
                        self.stack.pop();
                        continue;
                    }
                }
            };

            if self.source.recursive && self.source.endpoint.is_dir(&path) {
                match self.list_sorted(&path) {
                    Ok(names) => self.stack.push(Frame {
                        dir: path,
                        relative,
                        names,
                    }),
                    Err(e) if is_connection_lost(&e) => {
                        self.finished = true;
                        return Some(Err(e));
                    }
                    Err(e) => {
                        error!(path = %relative, error = %e, "Source - directory");
                        return Some(Ok(FileEntry::Error { path: relative, error: e }));
                    }
                }
                continue;
            }

            if !self.source.endpoint.is_file(&path) || !self.source.selects(&relative) {
                continue;
            }
            if (self.skip)(&relative) {
                debug!(path = %relative, "skipped");
                continue;
            }
            debug!(path = %relative, "source file");
            return match self.source.endpoint.open_read(&path) {
                Ok(reader) => Some(Ok(FileEntry::Open {
                    path: relative,
                    reader,
                })),
                Err(e) => {
                    error!(path = %relative, error = %e, "Source - file");
                    Some(Ok(FileEntry::Error { path: relative, error: e }))
                }
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Location;
    use crate::endpoint::faulty::{Calls, Faults, FaultyEndpoint};
    use crate::endpoint::LocalEndpoint;
    use std::collections::HashSet;
    use std::fs;
    use std::io::Read;
    use std::path::Path;

    fn patterns(list: &[&str]) -> PatternSet {
        let owned: Vec<String> = list.iter().map(|s| s.to_string()).collect();
        PatternSet::new(&owned).expect("Failed to compile patterns")
    }

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().expect("no parent")).expect("Failed to create dir");
        fs::write(path, content).expect("Failed to write file");
    }

    fn config(root: &Path, files: &[&str]) -> SourceConfig {
        SourceConfig::new(
            Location::local(root.to_string_lossy()),
            files.iter().map(|s| s.to_string()).collect(),
        )
    }

    fn paths<F: FnMut(&str) -> bool>(walk: FileWalk<'_, F>) -> Vec<String> {
        walk.map(|entry| entry.expect("walk failed").path().to_string())
            .collect()
    }

    #[test]
    fn test_unrooted_pattern_matches_one_level_down() {
        let set = patterns(&["*.txt"]);
        assert!(set.is_match("a.txt"));
        assert!(set.is_match("sub/b.txt"));
        assert!(!set.is_match("sub/deeper/c.txt"));
        assert!(!set.is_match("a.csv"));
    }

    #[test]
    fn test_rooted_pattern_matches_only_at_base() {
        let set = patterns(&["/report-?.csv"]);
        assert!(set.is_match("report-1.csv"));
        assert!(!set.is_match("sub/report-1.csv"));
        assert!(!set.is_match("report-10.csv"));
    }

    #[test]
    fn test_character_class() {
        let set = patterns(&["data[0-9].bin"]);
        assert!(set.is_match("data7.bin"));
        assert!(!set.is_match("datax.bin"));
    }

    #[test]
    fn test_hidden_files_excluded_by_default() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let root = temp_dir.path();
        write(root, "a.txt", "a");
        write(root, ".hidden.txt", "h");
        write(root, "sub/b.txt", "b");

        let mut source = Source::new(Box::new(LocalEndpoint::new()), &config(root, &["*.txt"]))
            .expect("Failed to create source");
        assert_eq!(paths(source.walk(|_| false)), vec!["a.txt"]);
    }

    #[test]
    fn test_recursive_walk_is_sorted_depth_first() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let root = temp_dir.path();
        write(root, "b.txt", "b");
        write(root, "a/z.txt", "z");
        write(root, "a/b/deep.txt", "d");
        write(root, "c.txt", "c");

        let mut cfg = config(root, &["*.txt", "a/b/*.txt"]);
        cfg.recursive = true;
        let mut source =
            Source::new(Box::new(LocalEndpoint::new()), &cfg).expect("Failed to create source");
        assert_eq!(
            paths(source.walk(|_| false)),
            vec!["a/b/deep.txt", "a/z.txt", "b.txt", "c.txt"]
        );
    }

    #[test]
    fn test_entries_are_opened_for_reading() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        write(temp_dir.path(), "a.txt", "hello");
        let mut source = Source::new(
            Box::new(LocalEndpoint::new()),
            &config(temp_dir.path(), &["*.txt"]),
        )
        .expect("Failed to create source");

        let mut walk = source.walk(|_| false);
        match walk.next() {
            Some(Ok(FileEntry::Open { path, mut reader })) => {
                let mut content = String::new();
                reader.read_to_string(&mut content).expect("Failed to read");
                assert_eq!(path, "a.txt");
                assert_eq!(content, "hello");
            }
            _ => panic!("expected an open entry"),
        }
        assert!(walk.next().is_none());
    }

    #[test]
    fn test_skipped_files_are_never_opened() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let root = temp_dir.path();
        write(root, "a.txt", "a");
        write(root, "b.txt", "b");
        write(root, "READY", "");

        let calls: Calls = Default::default();
        let endpoint = FaultyEndpoint::new(Faults::default(), std::rc::Rc::clone(&calls));
        let mut source = Source::new(Box::new(endpoint), &config(root, &["*"]))
            .expect("Failed to create source");
        let done: HashSet<String> = ["a.txt".to_string()].into_iter().collect();

        let walked = paths(source.walk(|p| done.contains(p) || p == "READY"));
        assert_eq!(walked, vec!["b.txt"]);
        let reads: Vec<String> = calls
            .borrow()
            .iter()
            .filter(|c| c.starts_with("read"))
            .cloned()
            .collect();
        assert_eq!(reads.len(), 1);
        assert!(reads[0].ends_with("b.txt"));
    }

    #[test]
    fn test_unlistable_directory_becomes_error_entry() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let root = temp_dir.path();
        write(root, "a/x.txt", "x");
        write(root, "b/y.txt", "y");

        let faults = Faults {
            list: vec![("/a".into(), io::ErrorKind::PermissionDenied)],
            ..Faults::default()
        };
        let endpoint = FaultyEndpoint::new(faults, Default::default());
        let mut cfg = config(root, &["*.txt"]);
        cfg.recursive = true;
        let mut source = Source::new(Box::new(endpoint), &cfg).expect("Failed to create source");

        let entries: Vec<FileEntry> = source
            .walk(|_| false)
            .map(|e| e.expect("walk failed"))
            .collect();
        assert_eq!(entries.len(), 2);
        assert!(matches!(&entries[0], FileEntry::Error { path, .. } if path == "a"));
        assert!(matches!(&entries[1], FileEntry::Open { path, .. } if path == "b/y.txt"));
    }

    #[test]
    fn test_lost_connection_ends_walk() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let root = temp_dir.path();
        write(root, "a/x.txt", "x");
        write(root, "b/y.txt", "y");

        let faults = Faults {
            list: vec![("/a".into(), io::ErrorKind::ConnectionReset)],
            ..Faults::default()
        };
        let endpoint = FaultyEndpoint::new(faults, Default::default());
        let mut cfg = config(root, &["*.txt"]);
        cfg.recursive = true;
        let mut source = Source::new(Box::new(endpoint), &cfg).expect("Failed to create source");

        let mut walk = source.walk(|_| false);
        assert!(matches!(walk.next(), Some(Err(_))));
        assert!(walk.next().is_none());
    }

    #[test]
    fn test_missing_base_fails_walk() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let mut source = Source::new(
            Box::new(LocalEndpoint::new()),
            &config(&temp_dir.path().join("missing"), &["*"]),
        )
        .expect("Failed to create source");
        let mut walk = source.walk(|_| false);
        assert!(matches!(walk.next(), Some(Err(_))));
        assert!(walk.next().is_none());
    }

    #[test]
    fn test_unreadable_file_becomes_error_entry() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        write(temp_dir.path(), "a.txt", "a");
        let faults = Faults {
            open_read: vec!["a.txt".into()],
            ..Faults::default()
        };
        let endpoint = FaultyEndpoint::new(faults, Default::default());
        let mut source = Source::new(Box::new(endpoint), &config(temp_dir.path(), &["*.txt"]))
            .expect("Failed to create source");

        let entries: Vec<FileEntry> = source
            .walk(|_| false)
            .map(|e| e.expect("walk failed"))
            .collect();
        assert!(matches!(&entries[..], [FileEntry::Error { path, .. }] if path == "a.txt"));
    }

    #[test]
    fn test_complete_deletes_when_configured() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let root = temp_dir.path();
        write(root, "a.txt", "a");
        let mut cfg = config(root, &["*.txt"]);
        cfg.delete = true;
        let mut source =
            Source::new(Box::new(LocalEndpoint::new()), &cfg).expect("Failed to create source");

        let mut walk = source.walk(|_| false);
        let entry = walk.next().expect("no entry").expect("walk failed");
        let path = entry.path().to_string();
        drop(entry);
        walk.complete(&path);
        assert!(!root.join("a.txt").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinks_are_not_followed() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let root = temp_dir.path().join("root");
        let outside = temp_dir.path().join("outside");
        write(&root, "plain.txt", "p");
        write(&outside, "secret.txt", "s");
        std::os::unix::fs::symlink(outside.join("secret.txt"), root.join("link.txt"))
            .expect("Failed to link file");
        std::os::unix::fs::symlink(&outside, root.join("linked_dir"))
            .expect("Failed to link dir");

        let mut cfg = config(&root, &["*.txt", "linked_dir/*.txt"]);
        cfg.recursive = true;
        let mut source =
            Source::new(Box::new(LocalEndpoint::new()), &cfg).expect("Failed to create source");
        assert_eq!(paths(source.walk(|_| false)), vec!["plain.txt"]);
    }

    #[test]
    fn test_has_and_remove_file() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        write(temp_dir.path(), "READY", "");
        let mut source = Source::new(
            Box::new(LocalEndpoint::new()),
            &config(temp_dir.path(), &["*"]),
        )
        .expect("Failed to create source");
        assert!(source.has_file("READY"));
        source.remove_file("READY").expect("Failed to remove");
        assert!(!source.has_file("READY"));
    }
}
