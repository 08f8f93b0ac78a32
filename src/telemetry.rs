use std::cmp::Reverse;
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result};
use chrono::Utc;
use once_cell::sync::OnceCell;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt};

use crate::config::{LogFileSettings, LogSettings};

const LOG_PREFIX: &str = "pwmetrics";
const LOG_SUFFIX: &str = ".log.jsonl";

static LOG_GUARD: OnceCell<WorkerGuard> = OnceCell::new();
static ACTIVE_LOG_FILE: OnceCell<PathBuf> = OnceCell::new();
static TRACING_INITIALIZED: OnceCell<()> = OnceCell::new();

fn default_directive(verbose: bool) -> &'static str {
    if verbose { "pwmetrics=debug" } else { "pwmetrics=info" }
}

/// Install the global subscriber: human output on stderr plus, when
/// enabled, every event as JSON lines in the log directory.
///
/// Later calls in the same process are no-ops.
pub fn init_tracing(verbose: bool, settings: &LogSettings) -> Result<()> {
    if TRACING_INITIALIZED.get().is_some() {
        return Ok(());
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)));
    let json_layer = build_log_file_layer(&settings.file)?.map(|(writer, guard, path)| {
        let _ = LOG_GUARD.set(guard);
        let _ = ACTIVE_LOG_FILE.set(path);
        fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_file(true)
            .with_line_number(true)
            .with_writer(writer)
            .with_filter(LevelFilter::TRACE)
    });

    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_writer(io::stderr))
        .with(json_layer);
    tracing::subscriber::set_global_default(subscriber)
        .context("A global tracing subscriber is already installed")?;
    let _ = TRACING_INITIALIZED.set(());
    Ok(())
}

/// Log file written by the current process, if any.
pub fn current_log_file() -> Option<&'static PathBuf> {
    ACTIVE_LOG_FILE.get()
}

fn build_log_file_layer(
    settings: &LogFileSettings,
) -> Result<Option<(NonBlocking, WorkerGuard, PathBuf)>> {
    if !settings.enabled {
        return Ok(None);
    }

    let directory = settings.resolve_directory()?;
    fs::create_dir_all(&directory)
        .with_context(|| format!("Failed to create log directory {}", directory.display()))?;

    let (file, path) = create_log_file(&directory)?;
    prune_old_logs(&directory, settings.max_files, &path)?;

    let (writer, guard) = tracing_appender::non_blocking(file);

    Ok(Some((writer, guard, path)))
}

fn create_log_file(directory: &Path) -> Result<(std::fs::File, PathBuf)> {
    let timestamp = Utc::now().format("%Y%m%dT%H%M%SZ");
    let mut candidate = directory.join(format!("{LOG_PREFIX}-{timestamp}{LOG_SUFFIX}"));
    let mut counter = 0;
    while candidate.exists() {
        counter += 1;
        candidate = directory.join(format!("{LOG_PREFIX}-{timestamp}-{counter}{LOG_SUFFIX}"));
    }

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&candidate)
        .with_context(|| format!("Failed to open log file {}", candidate.display()))?;
    Ok((file, candidate))
}

/// Keep at most `max_files` logs in `directory`, `keep` included. Zero disables pruning.
fn prune_old_logs(directory: &Path, max_files: usize, keep: &Path) -> Result<()> {
    if max_files == 0 {
        return Ok(());
    }

    let mut entries = collect_logs(directory)?;
    entries.retain(|(_, path)| path != keep);
    let retain = max_files.saturating_sub(1);
    for (_, path) in entries.into_iter().skip(retain) {
        let _ = fs::remove_file(&path);
    }
    Ok(())
}

/// Log files in `directory`, newest first.
fn collect_logs(directory: &Path) -> Result<Vec<(SystemTime, PathBuf)>> {
    let mut entries: Vec<(SystemTime, PathBuf)> = Vec::new();
    if !directory.exists() {
        return Ok(entries);
    }
    for entry in fs::read_dir(directory)
        .with_context(|| format!("Failed to read log directory {}", directory.display()))?
    {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|value| value.to_str()) else {
            continue;
        };
        if !name.starts_with(LOG_PREFIX) || !name.ends_with(LOG_SUFFIX) {
            continue;
        }
        let Ok(modified) = entry.metadata().and_then(|metadata| metadata.modified()) else {
            continue;
        };
        entries.push((modified, path));
    }
    entries.sort_by_key(|(modified, _)| Reverse(*modified));
    Ok(entries)
}
