//! Statistics dump log
//!
//! Appends one row per parameter per dump, followed by the ingestion counters.

use chrono::Local;
use std::fmt::Write as _;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

use super::format::format_timestamp;
use super::unique_path;
use crate::error::{LoggerError, Result};
use crate::stats::{StatsSnapshot, Summary};

/// Column header of the statistics log
pub const STATS_HEADER: &str =
    "timestamp,parameter,min,max,mean,std_dev,count,window_mean,window_std_dev,window_count,last\n";

/// Writer for `<prefix>Stats_<timestamp>.csv`
#[derive(Debug)]
pub struct StatsLog {
    path: PathBuf,
    out: BufWriter<File>,
    dumps: u64,
}

impl StatsLog {
    /// Create the statistics file in `dir`
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the file cannot be created
    pub fn open(dir: &Path, prefix: &str) -> Result<Self> {
        let startup_error = |e: std::io::Error| {
            let msg = format!("cannot create statistics log in {}: {}", dir.display(), e);
            LoggerError::InvalidConfig(msg)
        };

        fs::create_dir_all(dir).map_err(startup_error)?;
        let path = unique_path(dir, prefix, "Stats", "csv", &Local::now(), &[]);
        let file = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(&path)
            .map_err(startup_error)?;

        let mut out = BufWriter::new(file);
        out.write_all(STATS_HEADER.as_bytes())
            .and_then(|_| out.flush())
            .map_err(startup_error)?;

        debug!("Opened statistics log {}", path.display());
        Ok(Self { path, out, dumps: 0 })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of dumps written
    pub fn dumps(&self) -> u64 {
        self.dumps
    }

    /// Append a snapshot
    ///
    /// # Errors
    ///
    /// Returns `LogWrite` if the write fails
    pub fn write_snapshot(&mut self, snapshot: &StatsSnapshot) -> Result<()> {
        let text = render(snapshot);
        self.out
            .write_all(text.as_bytes())
            .and_then(|_| self.out.flush())
            .map_err(|e| {
                LoggerError::LogWrite(format!("write to {} failed: {}", self.path.display(), e))
            })?;
        self.dumps += 1;
        Ok(())
    }
}

fn opt(value: Option<f64>) -> String {
    value.map(|v| format!("{:.6}", v)).unwrap_or_default()
}

fn render(snapshot: &StatsSnapshot) -> String {
    let ts = format_timestamp(&snapshot.taken_at);
    let mut text = String::new();

    for (code, stats) in &snapshot.parameters {
        let Summary {
            count,
            mean,
            min,
            max,
            std_dev,
        } = stats.cumulative;
        let _ = writeln!(
            text,
            "{},{},{:.6},{:.6},{:.6},{},{},{:.6},{},{},{:.6}",
            ts,
            code,
            min,
            max,
            mean,
            opt(std_dev),
            count,
            stats.window.mean,
            opt(stats.window.std_dev),
            stats.window.count,
            stats.last
        );
    }

    for (name, value) in snapshot.counters.rows() {
        let _ = writeln!(text, "{},{},,,,,{},,,,", ts, name, value);
    }

    text
}
