//! Crash-safe record of physical deletions still owed.
//!
//! The file holds one storage key per line and only ever grows between
//! flushes. Every append is fsynced before the caller commits the metadata
//! delete, so after a crash each object whose metadata is gone is still
//! listed here. A full flush removes the file.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::{GcError, Result};

#[derive(Debug)]
pub struct TargetsBuffer {
    path: PathBuf,
    targets: Vec<String>,
}

impl TargetsBuffer {
    /// Open the buffer at `path`, loading whatever a previous run left.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| GcError::buffer(parent, e))?;
            }
        }

        let targets = match fs::read_to_string(&path) {
            Ok(content) => content
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect(),
            Err(e) if e.kind() == ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(GcError::buffer(&path, e)),
        };

        let buffer = Self { path, targets };
        if !buffer.targets.is_empty() {
            info!(
                path = %buffer.path.display(),
                count = buffer.targets.len(),
                "Recovered pending deletions"
            );
        }
        Ok(buffer)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn targets(&self) -> &[String] {
        &self.targets
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Append `keys` and fsync before returning.
    pub fn append(&mut self, keys: &[String]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        for key in keys {
            if key.is_empty() || key.contains('\n') {
                return Err(GcError::InvalidTarget(format!("{:?}", key)));
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| GcError::buffer(&self.path, e))?;
        let mut lines = String::new();
        for key in keys {
            lines.push_str(key);
            lines.push('\n');
        }
        file.write_all(lines.as_bytes())
            .and_then(|_| file.sync_all())
            .map_err(|e| GcError::buffer(&self.path, e))?;

        self.targets.extend(keys.iter().cloned());
        debug!(path = %self.path.display(), added = keys.len(), "Buffered targets");
        Ok(())
    }

    /// Keep only `remaining`. An empty list removes the file.
    pub fn retain(&mut self, remaining: Vec<String>) -> Result<()> {
        if remaining.is_empty() {
            match fs::remove_file(&self.path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(GcError::buffer(&self.path, e)),
            }
            self.targets.clear();
            return Ok(());
        }
        if remaining.len() == self.targets.len() {
            return Ok(());
        }

        // Write the survivors next to the file, then swap it in.
        let temp_path = self.path.with_extension("tmp");
        let mut content = String::new();
        for key in &remaining {
            content.push_str(key);
            content.push('\n');
        }
        let write = || -> std::io::Result<()> {
            let mut file = File::create(&temp_path)?;
            file.write_all(content.as_bytes())?;
            file.sync_all()?;
            fs::rename(&temp_path, &self.path)
        };
        write().map_err(|e| GcError::buffer(&self.path, e))?;

        self.targets = remaining;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn keys(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn test_appends_survive_reopen() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("gc").join("archive_targets.txt");

        let mut buffer = TargetsBuffer::open(&path).unwrap();
        assert!(buffer.is_empty());
        buffer.append(&keys(&["42/archiveA"])).unwrap();
        buffer.append(&keys(&["42/archiveB", "archiveC"])).unwrap();
        drop(buffer);

        let reopened = TargetsBuffer::open(&path).unwrap();
        assert_eq!(
            reopened.targets(),
            &keys(&["42/archiveA", "42/archiveB", "archiveC"])[..]
        );
    }

    #[test]
    fn test_full_flush_removes_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("targets.txt");

        let mut buffer = TargetsBuffer::open(&path).unwrap();
        buffer.append(&keys(&["a", "b"])).unwrap();
        assert!(path.exists());

        buffer.retain(Vec::new()).unwrap();
        assert!(!path.exists());
        assert!(buffer.is_empty());
        // Removing an already removed file is fine.
        buffer.retain(Vec::new()).unwrap();
    }

    #[test]
    fn test_partial_flush_keeps_failures() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("targets.txt");

        let mut buffer = TargetsBuffer::open(&path).unwrap();
        buffer.append(&keys(&["a", "b", "c"])).unwrap();
        buffer.retain(keys(&["b"])).unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "b\n");
        assert_eq!(TargetsBuffer::open(&path).unwrap().targets(), &keys(&["b"])[..]);
    }

    #[test]
    fn test_rejects_multiline_keys() {
        let tmp = TempDir::new().unwrap();
        let mut buffer = TargetsBuffer::open(tmp.path().join("targets.txt")).unwrap();
        let err = buffer.append(&keys(&["ok", "bad\nkey"])).unwrap_err();
        assert!(matches!(err, GcError::InvalidTarget(_)));
        assert!(buffer.is_empty());
    }
}
