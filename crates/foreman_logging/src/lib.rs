//! Shared logging setup for Foreman binaries.
//!
//! Log output goes to stderr and to a size-rotated file under
//! `~/.foreman/logs`. Rotation archives the active file under a
//! timestamped name and prunes the oldest archives, so the directory
//! holds the active file plus at most `keep_files` archives per binary.

use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_LOG_FILTER: &str =
    "foreman=info,foreman_dispatch=info,foreman_registry=info,foreman_store=info";

/// File rotation policy. Deployments that log heavily (a busy dispatch
/// loop with verbose filters) raise both knobs from the CLI layer.
#[derive(Debug, Clone, Copy)]
pub struct RotationPolicy {
    /// Archive the active file once it reaches this many bytes.
    pub max_file_bytes: u64,
    /// Archives kept per binary; the oldest beyond this are deleted.
    pub keep_files: usize,
}

impl Default for RotationPolicy {
    fn default() -> Self {
        Self {
            max_file_bytes: 8 * 1024 * 1024,
            keep_files: 4,
        }
    }
}

/// Logging configuration for a Foreman binary.
pub struct LogConfig<'a> {
    pub app_name: &'a str,
    /// Mirror the file-level filter onto stderr.
    pub verbose: bool,
    /// Only warnings and errors on stderr.
    pub quiet: bool,
    pub rotation: RotationPolicy,
}

/// Initialize tracing with a size-rotated file plus stderr output.
pub fn init_logging(config: LogConfig<'_>) -> Result<()> {
    let log_dir = ensure_logs_dir().context("Failed to ensure log directory")?;
    let sink = LogSink::open(log_dir, slug(config.app_name), config.rotation)
        .context("Failed to open log sink")?;

    let file_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let console_filter = if config.quiet && !config.verbose {
        EnvFilter::new("warn")
    } else {
        file_filter.clone()
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(Mutex::new(sink))
                .with_ansi(false)
                .with_filter(file_filter),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(console_filter),
        )
        .init();

    Ok(())
}

/// The Foreman home directory: `~/.foreman`, or `FOREMAN_HOME`.
pub fn foreman_home() -> PathBuf {
    if let Ok(override_path) = std::env::var("FOREMAN_HOME") {
        return PathBuf::from(override_path);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".foreman")
}

/// The logs directory: `~/.foreman/logs`.
pub fn logs_dir() -> PathBuf {
    foreman_home().join("logs")
}

/// Ensure the logs directory exists.
pub fn ensure_logs_dir() -> Result<PathBuf> {
    let logs = logs_dir();
    fs::create_dir_all(&logs)
        .with_context(|| format!("Failed to create logs directory: {}", logs.display()))?;
    Ok(logs)
}

/// Collapse an app name into a filename stem: alphanumeric runs joined
/// by single dashes, lowercased. `"Foreman (dev)"` becomes `foreman-dev`.
fn slug(name: &str) -> String {
    let parts: Vec<&str> = name
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|part| !part.is_empty())
        .collect();
    if parts.is_empty() {
        "foreman".to_string()
    } else {
        parts.join("-").to_ascii_lowercase()
    }
}

/// Size-rotated log file. The active file is `<app>.log`; on rotation it
/// is renamed to `<app>.<epoch-secs>-<seq>.log` and a fresh active file
/// is opened.
struct LogSink {
    dir: PathBuf,
    app: String,
    policy: RotationPolicy,
    file: File,
    written: u64,
    rolls: u32,
}

impl LogSink {
    fn open(dir: PathBuf, app: String, policy: RotationPolicy) -> io::Result<Self> {
        fs::create_dir_all(&dir)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(format!("{app}.log")))?;
        let written = file.metadata()?.len();
        Ok(Self {
            dir,
            app,
            policy,
            file,
            written,
            rolls: 0,
        })
    }

    fn active_path(&self) -> PathBuf {
        self.dir.join(format!("{}.log", self.app))
    }

    fn roll(&mut self) -> io::Result<()> {
        self.file.flush()?;

        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let mut seq = self.rolls;
        let mut archive = self.dir.join(format!("{}.{stamp}-{seq:03}.log", self.app));
        while archive.exists() {
            seq += 1;
            archive = self.dir.join(format!("{}.{stamp}-{seq:03}.log", self.app));
        }
        fs::rename(self.active_path(), &archive)?;
        self.rolls = seq + 1;
        self.prune()?;

        self.file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.active_path())?;
        self.written = 0;
        Ok(())
    }

    /// Delete the oldest archives beyond `keep_files`. Archive names sort
    /// chronologically (fixed-width epoch stamp, then sequence).
    fn prune(&self) -> io::Result<()> {
        let active = format!("{}.log", self.app);
        let prefix = format!("{}.", self.app);
        let mut archives: Vec<String> = fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| name.starts_with(&prefix) && name.ends_with(".log") && *name != active)
            .collect();
        archives.sort();
        let excess = archives.len().saturating_sub(self.policy.keep_files);
        for name in archives.into_iter().take(excess) {
            fs::remove_file(self.dir.join(name))?;
        }
        Ok(())
    }
}

impl Write for LogSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written > 0 && self.written + buf.len() as u64 > self.policy.max_file_bytes {
            self.roll()?;
        }
        let written = self.file.write(buf)?;
        self.written += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}
