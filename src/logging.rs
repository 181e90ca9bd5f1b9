//! Tracing subscriber setup
//!
//! Events go to the console and, without ANSI colours, to
//! `log_dir/main_log_file`. `RUST_LOG` overrides the configured level.
//! The file is rotated by size and old rotations are pruned at startup.

use anyhow::{Context, Result};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::warn;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LoggingConfig;
use crate::files;

const BYTES_PER_MB: u64 = 1024 * 1024;
const SECS_PER_DAY: u64 = 24 * 60 * 60;

/// Install the global subscriber. Call once, before any stage runs.
pub fn init(config: &LoggingConfig) -> Result<()> {
    std::fs::create_dir_all(&config.log_dir)
        .with_context(|| format!("Failed to create log directory: {}", config.log_dir.display()))?;

    let log_path = config.log_dir.join(&config.main_log_file);
    let removed = prune_rotated(&log_path, Duration::from_secs(config.retention_days * SECS_PER_DAY))?;
    let log_file = RotatingFile::open(&log_path, config.rotation_mb * BYTES_PER_MB)?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .with_context(|| format!("Invalid log level: {}", config.log_level))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .with(
            fmt::layer()
                .with_ansi(false)
                .with_target(true)
                .with_writer(Mutex::new(log_file)),
        )
        .try_init()
        .context("Failed to install tracing subscriber")?;

    tracing::info!(
        log_file = %log_path.display(),
        rotation_mb = config.rotation_mb,
        retention_days = config.retention_days,
        pruned = removed,
        "Logging configured"
    );
    Ok(())
}

/// Append-only file that moves itself aside once it would exceed `max_bytes`
///
/// Rotated files are named `<file>.<unix_secs>` (plus `.<n>` if that name is
/// taken). A `max_bytes` of zero never rotates.
#[derive(Debug)]
pub struct RotatingFile {
    path: PathBuf,
    file: File,
    written: u64,
    max_bytes: u64,
}

impl RotatingFile {
    pub fn open(path: &Path, max_bytes: u64) -> Result<Self> {
        let file = open_append(path).with_context(|| format!("Failed to open log file: {}", path.display()))?;
        let written = file.metadata().map(|m| m.len()).unwrap_or(0);
        Ok(Self {
            path: path.to_path_buf(),
            file,
            written,
            max_bytes,
        })
    }

    fn rotate(&mut self) -> io::Result<()> {
        self.file.flush()?;
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let base = format!("{}.{secs}", self.path.display());
        let mut target = PathBuf::from(&base);
        let mut n = 1;
        while target.exists() {
            target = PathBuf::from(format!("{base}.{n}"));
            n += 1;
        }
        std::fs::rename(&self.path, &target)?;
        self.file = open_append(&self.path)?;
        self.written = 0;
        Ok(())
    }
}

impl Write for RotatingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // a single oversized event still lands in one file
        if self.max_bytes > 0 && self.written > 0 && self.written + buf.len() as u64 > self.max_bytes {
            self.rotate()?;
        }
        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

fn is_rotation_of(candidate: &Path, log_path: &Path) -> bool {
    let (Some(name), Some(log_name)) = (
        candidate.file_name().and_then(|n| n.to_str()),
        log_path.file_name().and_then(|n| n.to_str()),
    ) else {
        return false;
    };
    name.strip_prefix(log_name)
        .and_then(|rest| rest.strip_prefix('.'))
        .is_some_and(|suffix| suffix.split('.').all(|part| !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit())))
}

/// Delete rotations of `log_path` last modified more than `retention` ago.
/// Returns how many were removed.
pub fn prune_rotated(log_path: &Path, retention: Duration) -> Result<usize> {
    let Some(dir) = log_path.parent() else {
        return Ok(0);
    };
    if !dir.is_dir() {
        return Ok(0);
    }
    let now = SystemTime::now();
    let mut removed = 0;
    for candidate in files::list_files(dir, &[])? {
        if !is_rotation_of(&candidate, log_path) {
            continue;
        }
        let age = std::fs::metadata(&candidate)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| now.duration_since(modified).ok());
        if age.is_some_and(|age| age > retention) {
            match std::fs::remove_file(&candidate) {
                Ok(()) => removed += 1,
                Err(e) => warn!(path = %candidate.display(), error = %e, "Failed to remove old log file"),
            }
        }
    }
    Ok(removed)
}
