//! Subscriber setup.
//!
//! Console output is always on. With `LOG_DIR` set, a daily rolling file is
//! written as well and files past [`LOG_RETENTION_DAYS`] are pruned once a day.
//! The filter stays reloadable for the lifetime of the process.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, NaiveDate, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter, Registry,
    fmt::{self, format::Writer, time::FormatTime},
    layer::SubscriberExt,
    reload,
    util::SubscriberInitExt,
};

use crate::config::LoggingSettings;
use crate::{Error, Result};

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_LOG_FILTER: &str = "stream_caster=info,tower_http=info,reqwest=warn";

/// Rolling files are named `<prefix>.<YYYY-MM-DD>`.
const LOG_FILE_PREFIX: &str = "stream-caster.log";

/// Days a rolling file is kept.
pub const LOG_RETENTION_DAYS: i64 = 7;

const PRUNE_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Local-time RFC 3339 timestamps.
#[derive(Debug, Clone, Copy)]
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", Local::now().format("%Y-%m-%dT%H:%M:%S%.3f%:z"))
    }
}

/// Runtime control over the installed subscriber.
pub struct LoggingHandle {
    filter: reload::Handle<EnvFilter, Registry>,
    log_dir: Option<PathBuf>,
}

impl LoggingHandle {
    /// Active filter directive.
    pub fn filter(&self) -> String {
        self.filter
            .with_current(ToString::to_string)
            .unwrap_or_default()
    }

    /// Swap the filter, e.g. `"stream_caster=debug"`.
    pub fn set_filter(&self, directive: &str) -> Result<()> {
        let filter = EnvFilter::try_new(directive)
            .map_err(|e| Error::config(format!("Invalid log filter '{directive}': {e}")))?;
        self.filter
            .reload(filter)
            .map_err(|e| Error::Other(format!("Failed to reload log filter: {e}")))?;

        info!(%directive, "Log filter updated");
        Ok(())
    }

    pub fn log_dir(&self) -> Option<&Path> {
        self.log_dir.as_deref()
    }

    /// Prune expired rolling files daily until `cancel` fires.
    /// No-op without a log directory.
    pub fn start_retention_cleanup(self: &Arc<Self>, cancel: CancellationToken) {
        let Some(log_dir) = self.log_dir.clone() else {
            return;
        };

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PRUNE_INTERVAL);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let cutoff = (Utc::now() - chrono::Duration::days(LOG_RETENTION_DAYS)).date_naive();
                        match prune_logs(&log_dir, cutoff).await {
                            Ok(0) => {}
                            Ok(removed) => info!(removed, "Pruned expired log files"),
                            Err(e) => warn!(error = %e, dir = %log_dir.display(), "Log pruning failed"),
                        }
                    }
                }
            }
            debug!("Log pruning stopped");
        });
    }
}

/// Date of a rolling log file, `None` for unrelated files.
fn log_file_date(file_name: &str) -> Option<NaiveDate> {
    let date = file_name
        .strip_prefix(LOG_FILE_PREFIX)?
        .strip_prefix('.')?;
    NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
}

/// Remove rolling files dated before `cutoff`. Returns how many were removed.
async fn prune_logs(log_dir: &Path, cutoff: NaiveDate) -> std::io::Result<usize> {
    let mut entries = tokio::fs::read_dir(log_dir).await?;
    let mut removed = 0;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let expired = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(log_file_date)
            .is_some_and(|date| date < cutoff);
        if !expired {
            continue;
        }

        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                removed += 1;
                debug!(path = %path.display(), "Removed log file");
            }
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove log file"),
        }
    }

    Ok(removed)
}

/// Install the global subscriber.
///
/// The returned guard flushes the file writer on drop and must be held by
/// `main` until exit.
pub fn init_logging(settings: &LoggingSettings) -> Result<(Arc<LoggingHandle>, Option<WorkerGuard>)> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let (filter_layer, filter_handle) = reload::Layer::new(filter);

    let (file_layer, guard) = match &settings.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX));
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_timer(LocalTimer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt::layer().with_timer(LocalTimer))
        .with(file_layer)
        .try_init()
        .map_err(|e| Error::Other(format!("Logging already initialised: {e}")))?;

    let handle = Arc::new(LoggingHandle {
        filter: filter_handle,
        log_dir: settings.log_dir.clone(),
    });
    Ok((handle, guard))
}
