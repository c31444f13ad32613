//! Tracing setup: console output, a daily rolling file and a filter that can
//! be swapped at runtime through the API.

use chrono::{Local, NaiveDate, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry, fmt, reload};

use crate::{Error, Result};

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_LOG_FILTER: &str = "docproc=info,sqlx=warn,tower_http=info";

/// Targets worth tuning at runtime, with a short description each.
pub const LOG_TARGETS: &[(&str, &str)] = &[
    ("docproc", "Everything in this service"),
    ("docproc::queue", "Task queue and retry scheduling"),
    ("docproc::pipeline", "Job coordinator and stage handlers"),
    ("docproc::progress", "Progress snapshots and subscriber delivery"),
    ("docproc::database", "SQLite stores"),
    ("sqlx", "SQL statements"),
    ("tower_http", "HTTP requests"),
];

const FILE_PREFIX: &str = "docproc.log";

const PRUNE_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Where and how log files are written.
#[derive(Debug, Clone)]
pub struct LogOptions {
    pub dir: PathBuf,
    /// Rolled files older than this many days are deleted.
    pub retention_days: i64,
    /// Write the file as JSON lines instead of plain text.
    pub json: bool,
}

impl LogOptions {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            retention_days: 7,
            json: false,
        }
    }

    pub fn with_json(mut self, json: bool) -> Self {
        self.json = json;
        self
    }
}

/// Millisecond timestamps in the host's timezone.
struct LocalTime;

impl FormatTime for LocalTime {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", Local::now().format("%Y-%m-%d %H:%M:%S%.3f"))
    }
}

type FilterHandle = reload::Handle<EnvFilter, Registry>;

/// Handle to the installed subscriber.
pub struct LoggingConfig {
    filter: FilterHandle,
    options: LogOptions,
}

impl LoggingConfig {
    pub fn current_filter(&self) -> String {
        self.filter
            .with_current(|filter| filter.to_string())
            .unwrap_or_default()
    }

    /// Swap the filter, e.g. `docproc::queue=debug,docproc=info`.
    pub fn set_filter(&self, directive: &str) -> Result<()> {
        let filter = EnvFilter::try_new(directive)
            .map_err(|e| Error::validation(format!("invalid log filter '{}': {}", directive, e)))?;
        self.filter
            .reload(filter)
            .map_err(|e| Error::Other(format!("log filter reload failed: {}", e)))?;
        info!(filter = directive, "Log filter changed");
        Ok(())
    }

    pub fn log_dir(&self) -> &Path {
        &self.options.dir
    }

    /// Prune rolled files once a day until cancelled.
    pub fn spawn_retention(&self, cancel_token: CancellationToken) -> JoinHandle<()> {
        let dir = self.options.dir.clone();
        let keep_days = self.options.retention_days;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => break,
                    _ = tokio::time::sleep(PRUNE_INTERVAL) => {
                        let today = Utc::now().date_naive();
                        if let Err(e) = prune_logs(&dir, keep_days, today).await {
                            warn!(dir = %dir.display(), error = %e, "Log pruning failed");
                        }
                    }
                }
            }
            debug!("Log retention stopped");
        })
    }
}

/// Date of a rolled file (`docproc.log.YYYY-MM-DD`); `None` for anything else.
fn rolled_date(file_name: &str) -> Option<NaiveDate> {
    let suffix = file_name.strip_prefix(FILE_PREFIX)?.strip_prefix('.')?;
    NaiveDate::parse_from_str(suffix, "%Y-%m-%d").ok()
}

/// Delete rolled files dated more than `keep_days` before `today`.
async fn prune_logs(dir: &Path, keep_days: i64, today: NaiveDate) -> std::io::Result<usize> {
    let cutoff = today - chrono::Duration::days(keep_days);
    let mut removed = 0;
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let Some(date) = name.to_str().and_then(rolled_date) else {
            continue;
        };
        if date >= cutoff {
            continue;
        }
        match tokio::fs::remove_file(entry.path()).await {
            Ok(()) => removed += 1,
            Err(e) => warn!(file = ?name, error = %e, "Could not delete old log file"),
        }
    }
    if removed > 0 {
        info!(removed, "Pruned old log files");
    }
    Ok(removed)
}

/// Install the global subscriber.
///
/// The returned guard flushes the file writer when dropped, so keep it alive
/// for as long as the process logs.
pub fn init_logging(options: LogOptions) -> Result<(Arc<LoggingConfig>, WorkerGuard)> {
    std::fs::create_dir_all(&options.dir)?;
    let (file_writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(&options.dir, FILE_PREFIX));

    let initial = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let (filter_layer, filter) = reload::Layer::new(initial);

    let json_file = options.json.then(|| {
        fmt::layer()
            .json()
            .with_writer(file_writer.clone())
            .with_timer(LocalTime)
    });
    let text_file = (!options.json).then(|| {
        fmt::layer()
            .with_writer(file_writer)
            .with_ansi(false)
            .with_timer(LocalTime)
    });

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt::layer().with_timer(LocalTime))
        .with(json_file)
        .with(text_file)
        .try_init()
        .map_err(|e| Error::Other(format!("tracing subscriber already installed: {}", e)))?;

    Ok((Arc::new(LoggingConfig { filter, options }), guard))
}
