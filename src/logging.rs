use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Context;
use file_rotate::compression::Compression;
use file_rotate::suffix::AppendCount;
use file_rotate::{ContentLimit, FileRotate};
use once_cell::sync::{Lazy, OnceCell};
use sha2::{Digest, Sha256};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

pub const LOG_FILE_NAME: &str = "mediamigrate.log";
pub const LOG_ENV: &str = "MEDIAMIGRATE_LOG";
pub const LOG_MAX_SIZE_ENV: &str = "MEDIAMIGRATE_LOG_MAX_SIZE_BYTES";
pub const LOG_MAX_FILES_ENV: &str = "MEDIAMIGRATE_LOG_MAX_FILES";

const DEFAULT_FILTER: &str = "mediamigrate=info";
const DEFAULT_MAX_SIZE_BYTES: usize = 5 * 1024 * 1024;
const DEFAULT_MAX_FILES: usize = 5;

static FILE_WRITER: OnceCell<NonBlocking> = OnceCell::new();
static FILE_GUARD: Lazy<Mutex<Option<WorkerGuard>>> = Lazy::new(|| Mutex::new(None));

/// Hashes a path for logging so user file names never reach the log sinks.
pub fn hash_path(p: &Path) -> String {
    let mut h = Sha256::new();
    h.update(p.as_os_str().to_string_lossy().as_bytes());
    format!("{:x}", h.finalize())
}

/// Writer handed to the file layer. Until [`init_file_logging`] wires the
/// rotating sink, every line is discarded.
#[derive(Clone, Copy, Default)]
struct LateFileWriter;

impl<'a> MakeWriter<'a> for LateFileWriter {
    type Writer = Box<dyn io::Write + Send + 'a>;

    fn make_writer(&'a self) -> Self::Writer {
        match FILE_WRITER.get() {
            Some(writer) => Box::new(writer.make_writer()),
            None => Box::new(io::sink()),
        }
    }
}

fn env_filter() -> EnvFilter {
    std::env::var(LOG_ENV)
        .or_else(|_| std::env::var("RUST_LOG"))
        .map(EnvFilter::new)
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Installs the global subscriber: JSON lines to stderr plus a file layer
/// that stays silent until [`init_file_logging`] runs. Safe to call twice.
pub fn init_logging() {
    let _ = tracing_log::LogTracer::init();

    let stderr_layer = tracing_subscriber::fmt::layer()
        .json()
        .flatten_event(true)
        .with_target(true)
        .with_timer(UtcTime::rfc_3339())
        .with_writer(io::stderr);

    let file_layer = tracing_subscriber::fmt::layer()
        .json()
        .flatten_event(true)
        .with_target(true)
        .with_ansi(false)
        .with_timer(UtcTime::rfc_3339())
        .with_writer(LateFileWriter);

    let _ = tracing_subscriber::registry()
        .with(env_filter())
        .with(stderr_layer)
        .with(file_layer)
        .try_init();
}

fn env_usize(name: &str, default: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<usize>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

/// Wires the size-rotated file sink under `logs_dir` and returns the path of
/// the active log file.
pub fn init_file_logging(logs_dir: &Path) -> anyhow::Result<PathBuf> {
    std::fs::create_dir_all(logs_dir)
        .with_context(|| format!("create log directory {}", logs_dir.display()))?;
    let log_path = logs_dir.join(LOG_FILE_NAME);

    if FILE_WRITER.get().is_some() {
        return Ok(log_path);
    }

    let max_bytes = env_usize(LOG_MAX_SIZE_ENV, DEFAULT_MAX_SIZE_BYTES);
    let max_files = env_usize(LOG_MAX_FILES_ENV, DEFAULT_MAX_FILES);

    let rotate = FileRotate::new(
        &log_path,
        AppendCount::new(max_files),
        ContentLimit::BytesSurpassed(max_bytes),
        Compression::None,
        #[cfg(unix)]
        None,
    );
    let (writer, guard) = tracing_appender::non_blocking(rotate);

    if FILE_WRITER.set(writer).is_ok() {
        let mut slot = FILE_GUARD.lock().unwrap_or_else(|e| e.into_inner());
        *slot = Some(guard);
    }

    tracing::debug!(
        target: "mediamigrate",
        event = "file_logging_ready",
        max_bytes,
        max_files,
    );
    Ok(log_path)
}

/// Flushes buffered file log lines. Further lines after this are dropped.
pub fn flush_file_logs() {
    let mut slot = FILE_GUARD.lock().unwrap_or_else(|e| e.into_inner());
    drop(slot.take());
}
