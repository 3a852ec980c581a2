//! Shared logging setup for the logvault daemons.
//!
//! Each daemon writes to `<logs_directory>/<component>.log`, rotated by size,
//! and mirrors the same events to stderr.

use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_LOG_FILTER: &str =
    "logvault_scheduler=info,logvault_gc=info,logvault_worker=info,logvault_db=warn";
const MAX_LOG_FILES: usize = 5;
const MAX_LOG_FILE_SIZE: u64 = 10 * 1024 * 1024;

pub struct LogConfig<'a> {
    /// Log file stem, e.g. `scheduler` or `garbage_collector`.
    pub component: &'a str,
    /// Falls back to [`default_logs_dir`] when unset.
    pub logs_directory: Option<&'a Path>,
    /// Mirror debug-level events to stderr.
    pub verbose: bool,
}

/// Install the global subscriber. `RUST_LOG` overrides the default filter.
pub fn init_logging(config: LogConfig<'_>) -> Result<()> {
    let log_dir = match config.logs_directory {
        Some(dir) => dir.to_path_buf(),
        None => default_logs_dir(),
    };
    fs::create_dir_all(&log_dir)
        .with_context(|| format!("Failed to create logs directory: {}", log_dir.display()))?;

    let appender = SizeRotatingFile::open(&log_dir, config.component, MAX_LOG_FILES, MAX_LOG_FILE_SIZE)
        .with_context(|| format!("Failed to open log file for {}", config.component))?;
    let file_writer = SharedWriter(Arc::new(Mutex::new(appender)));

    let default_filter =
        || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let file_filter = default_filter();
    let console_filter = if config.verbose {
        EnvFilter::new("debug")
    } else {
        default_filter()
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false)
                .with_filter(file_filter),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(io::stderr)
                .with_filter(console_filter),
        )
        .try_init()
        .context("Global tracing subscriber already installed")?;

    Ok(())
}

/// `$LOGVAULT_HOME/logs`, or `<data dir>/logvault/logs`.
pub fn default_logs_dir() -> PathBuf {
    if let Ok(home) = std::env::var("LOGVAULT_HOME") {
        return PathBuf::from(home).join("logs");
    }
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("logvault")
        .join("logs")
}

/// `<stem>.log` plus up to `keep - 1` older generations `<stem>.log.N`.
struct SizeRotatingFile {
    dir: PathBuf,
    stem: String,
    keep: usize,
    limit: u64,
    file: Option<File>,
    written: u64,
}

impl SizeRotatingFile {
    fn open(dir: &Path, component: &str, keep: usize, limit: u64) -> io::Result<Self> {
        let stem: String = component
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        let mut this = Self {
            dir: dir.to_path_buf(),
            stem,
            keep: keep.max(1),
            limit,
            file: None,
            written: 0,
        };
        this.reopen()?;
        if this.written > this.limit {
            this.roll()?;
        }
        Ok(this)
    }

    fn generation(&self, n: usize) -> PathBuf {
        if n == 0 {
            self.dir.join(format!("{}.log", self.stem))
        } else {
            self.dir.join(format!("{}.log.{}", self.stem, n))
        }
    }

    fn reopen(&mut self) -> io::Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.generation(0))?;
        self.written = file.metadata()?.len();
        self.file = Some(file);
        Ok(())
    }

    /// Shift every generation up by one, dropping the oldest.
    fn roll(&mut self) -> io::Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush()?;
        }
        let oldest = self.keep - 1;
        if oldest > 0 {
            let _ = fs::remove_file(self.generation(oldest));
            for n in (0..oldest).rev() {
                let from = self.generation(n);
                if from.exists() {
                    fs::rename(&from, self.generation(n + 1))?;
                }
            }
        } else {
            let _ = fs::remove_file(self.generation(0));
        }
        self.reopen()
    }
}

impl Write for SizeRotatingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written > 0 && self.written + buf.len() as u64 > self.limit {
            self.roll()?;
        }
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "log file unavailable"))?;
        let n = file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

#[derive(Clone)]
struct SharedWriter(Arc<Mutex<SizeRotatingFile>>);

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for SharedWriter {
    type Writer = SharedWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

impl Write for SharedWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log writer lock poisoned"))?
            .write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log writer lock poisoned"))?
            .flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotation_keeps_bounded_generations() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut file = SizeRotatingFile::open(dir.path(), "gc/sweeper", 3, 16).unwrap();

        for _ in 0..10 {
            file.write_all(b"0123456789abcdef").unwrap();
        }
        file.flush().unwrap();

        assert!(dir.path().join("gc_sweeper.log").exists());
        assert!(dir.path().join("gc_sweeper.log.1").exists());
        assert!(dir.path().join("gc_sweeper.log.2").exists());
        assert!(!dir.path().join("gc_sweeper.log.3").exists());
    }

    #[test]
    fn test_reopen_appends_to_existing_file() {
        let dir = tempfile::TempDir::new().unwrap();
        {
            let mut file = SizeRotatingFile::open(dir.path(), "scheduler", 2, 1024).unwrap();
            file.write_all(b"first\n").unwrap();
        }
        let mut file = SizeRotatingFile::open(dir.path(), "scheduler", 2, 1024).unwrap();
        file.write_all(b"second\n").unwrap();
        file.flush().unwrap();

        let content = fs::read_to_string(dir.path().join("scheduler.log")).unwrap();
        assert_eq!(content, "first\nsecond\n");
    }
}
