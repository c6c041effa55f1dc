use std::fs;
use std::path::{Path, PathBuf};

use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter, Registry};

pub const LOG_FILE_PREFIX: &str = "fmln.log";

pub struct LoggingConfig {
    pub level: String,
    pub console_output: bool,
    pub file_output: bool,
    pub log_dir: PathBuf,
    pub rotation: Rotation,
    pub max_log_files: Option<usize>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            console_output: true,
            file_output: false,
            log_dir: PathBuf::from("./logs"),
            rotation: Rotation::DAILY,
            max_log_files: Some(30),
        }
    }
}

impl LoggingConfig {
    /// Console-only logging at `level`
    pub fn console(level: impl Into<String>) -> Self {
        Self {
            level: level.into(),
            ..Self::default()
        }
    }

    /// Console plus daily-rotated JSON files under `log_dir`
    pub fn with_file_output(mut self, log_dir: impl Into<PathBuf>) -> Self {
        self.file_output = true;
        self.log_dir = log_dir.into();
        self
    }
}

/// Install the global subscriber. `RUST_LOG` overrides the configured level.
pub fn init_logging(config: LoggingConfig) -> anyhow::Result<()> {
    if !config.console_output && !config.file_output {
        return Err(anyhow::anyhow!(
            "At least one output (console or file) must be enabled"
        ));
    }

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let file_layer = if config.file_output {
        fs::create_dir_all(&config.log_dir)?;
        restrict_dir_permissions(&config.log_dir)?;

        if let Some(max_files) = config.max_log_files {
            cleanup_old_log_files(&config.log_dir, max_files)?;
        }

        let appender = RollingFileAppender::new(config.rotation, &config.log_dir, LOG_FILE_PREFIX);
        Some(
            fmt::layer()
                .json()
                .with_writer(appender)
                .with_current_span(true)
                .with_span_list(true),
        )
    } else {
        None
    };

    let console_layer = config.console_output.then(|| {
        fmt::layer()
            .pretty()
            .with_thread_ids(true)
            .with_target(true)
    });

    Registry::default()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to install tracing subscriber: {}", e))
}

#[cfg(unix)]
fn restrict_dir_permissions(log_dir: &Path) -> anyhow::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    // rwxr-x---
    fs::set_permissions(log_dir, fs::Permissions::from_mode(0o750))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_dir_permissions(_log_dir: &Path) -> anyhow::Result<()> {
    Ok(())
}

/// Keep only the `max_files` most recently modified log files
pub(crate) fn cleanup_old_log_files(log_dir: &Path, max_files: usize) -> anyhow::Result<usize> {
    let mut log_files: Vec<_> = fs::read_dir(log_dir)?
        .filter_map(|entry| {
            let entry = entry.ok()?;
            let path = entry.path();
            let is_log = path.is_file()
                && path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .map_or(false, |name| name.starts_with(LOG_FILE_PREFIX));
            if !is_log {
                return None;
            }
            let modified = entry.metadata().ok()?.modified().ok()?;
            Some((path, modified))
        })
        .collect();

    // Newest first
    log_files.sort_by(|a, b| b.1.cmp(&a.1));

    let mut removed = 0;
    for (path, _) in log_files.iter().skip(max_files) {
        match fs::remove_file(path) {
            Ok(()) => removed += 1,
            Err(e) => eprintln!("Failed to remove old log file {:?}: {}", path, e),
        }
    }

    Ok(removed)
}
