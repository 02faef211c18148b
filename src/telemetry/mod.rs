//! # Telemetry Module
//!
//! Persists readings and statistics to rotating log files.
//!
//! This module handles:
//! - Formatting readings as CSV, JSON lines or tagged raw echo ([`format`])
//! - Writing data logs with size/time rotation ([`writer`])
//! - Writing periodic statistics dumps ([`stats_log`])
//!
//! File names embed the configured prefix and the creation time, e.g.
//! `TrisonicaData_2024-05-01_134502.csv`.

pub mod format;
pub mod stats_log;
pub mod writer;

use chrono::{DateTime, Local};
use std::path::{Path, PathBuf};

pub use format::LogFormat;
pub use stats_log::StatsLog;
pub use writer::{LogWriter, WriterOptions};

/// Pick a fresh file name for a log created at `created`
///
/// A same-second collision with an existing file or a name already handed
/// out appends `_<n>`.
pub(crate) fn unique_path(
    dir: &Path,
    prefix: &str,
    kind: &str,
    extension: &str,
    created: &DateTime<Local>,
    taken: &[PathBuf],
) -> PathBuf {
    let stem = format!("{}{}_{}", prefix, kind, created.format("%Y-%m-%d_%H%M%S"));
    let mut candidate = dir.join(format!("{}.{}", stem, extension));
    let mut n = 1;
    while candidate.exists() || taken.contains(&candidate) {
        candidate = dir.join(format!("{}_{}.{}", stem, n, extension));
        n += 1;
    }
    candidate
}
