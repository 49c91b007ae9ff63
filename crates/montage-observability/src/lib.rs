//! Logging and structured coordination telemetry.
//!
//! A process installs one [`LogSink`]: compact console output for
//! operators plus a daily-rolling JSON file under the state dir, with
//! stale files pruned on startup. Subsystems report the coordination
//! moments worth querying later through [`CoordEvent`], which fixes one
//! stable field set per moment instead of free-form log messages.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Keeps the non-blocking file writer alive; dropping it flushes and
/// closes the JSON log.
pub struct LogSink {
    _guard: WorkerGuard,
    pub dir: PathBuf,
    pub prefix: String,
}

/// File-name prefix for one process's rolling logs. The appender adds the
/// date, so files land as `montage-<process>.log.YYYY-MM-DD`.
pub fn log_prefix(process: &str) -> String {
    format!("montage-{process}.log")
}

/// Install the global subscriber and return the sink handle. `RUST_LOG`
/// overrides the default `info` filter. Log files for this process older
/// than `retention_days` are removed before the first write.
pub fn init_logging(
    process: &str,
    logs_dir: &Path,
    retention_days: u64,
) -> anyhow::Result<LogSink> {
    fs::create_dir_all(logs_dir)?;
    let prefix = log_prefix(process);
    prune_stale_logs(logs_dir, &prefix, retention_days)?;

    let (writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(logs_dir, &prefix));
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().compact().with_target(true))
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(writer)
                .with_ansi(false),
        )
        .try_init()
        .ok();

    Ok(LogSink {
        _guard: guard,
        dir: logs_dir.to_path_buf(),
        prefix,
    })
}

/// Drop this process's log files whose last write predates the retention
/// window. Age comes from filesystem mtime, so hand-rotated or copied
/// files are collected too.
fn prune_stale_logs(logs_dir: &Path, prefix: &str, retention_days: u64) -> anyhow::Result<()> {
    let now = SystemTime::now();
    let max_age = Duration::from_secs(retention_days.saturating_mul(24 * 60 * 60));
    for entry in fs::read_dir(logs_dir)? {
        let Ok(entry) = entry else { continue };
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Ok(meta) = entry.metadata() else { continue };
        let age = meta
            .modified()
            .ok()
            .and_then(|modified| now.duration_since(modified).ok())
            .unwrap_or_default();
        if is_stale(name, prefix, meta.is_file(), age, max_age) {
            let _ = fs::remove_file(entry.path());
        }
    }
    Ok(())
}

fn is_stale(name: &str, prefix: &str, is_file: bool, age: Duration, max_age: Duration) -> bool {
    is_file && name.starts_with(prefix) && age > max_age
}

/// A coordination moment worth finding in the logs later.
///
/// Emitted under the `montage::coord` target so an operator can filter
/// the JSON stream by target plus field names. Each variant carries
/// exactly the ids that make the moment traceable.
pub enum CoordEvent<'a> {
    /// The scheduler handed a task to an agent.
    TaskDispatched {
        project_id: &'a str,
        task_id: &'a str,
        assignee: &'a str,
        assignment_event_id: &'a str,
    },
    /// A task reached a terminal disposition for this attempt.
    TaskSettled {
        project_id: &'a str,
        task_id: &'a str,
        outcome: &'a str,
    },
    /// The project stopped dispatching and awaits a human.
    ProjectPaused {
        project_id: &'a str,
        reason: &'a str,
    },
    /// Spend crossed a configured budget threshold.
    BudgetThreshold {
        project_id: &'a str,
        spent: f64,
        total: f64,
    },
}

impl CoordEvent<'_> {
    pub fn emit(&self) {
        match self {
            CoordEvent::TaskDispatched {
                project_id,
                task_id,
                assignee,
                assignment_event_id,
            } => {
                tracing::info!(
                    target: "montage::coord",
                    %project_id,
                    %task_id,
                    %assignee,
                    %assignment_event_id,
                    "task_dispatched"
                );
            }
            CoordEvent::TaskSettled {
                project_id,
                task_id,
                outcome,
            } => {
                tracing::info!(
                    target: "montage::coord",
                    %project_id,
                    %task_id,
                    %outcome,
                    "task_settled"
                );
            }
            CoordEvent::ProjectPaused { project_id, reason } => {
                tracing::warn!(
                    target: "montage::coord",
                    %project_id,
                    %reason,
                    "project_paused"
                );
            }
            CoordEvent::BudgetThreshold {
                project_id,
                spent,
                total,
            } => {
                tracing::warn!(
                    target: "montage::coord",
                    %project_id,
                    spent = *spent,
                    total = *total,
                    "budget_threshold"
                );
            }
        }
    }
}
