//! Rotating data log writer
//!
//! One active file per selected format. All formats rotate together, so the
//! files of one rotation period share a creation timestamp.
//!
//! Rotation opens the new files before the old ones are flushed and closed,
//! and happens only between two records: a reading is written to exactly one
//! file per format, or to none of them if any format fails.

use chrono::Local;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::format::LogFormat;
use super::unique_path;
use crate::error::{LoggerError, Result};
use crate::sensor::protocol::{ParameterTable, Reading};

/// Data log settings
#[derive(Debug, Clone)]
pub struct WriterOptions {
    pub dir: PathBuf,
    pub prefix: String,
    pub formats: Vec<LogFormat>,

    /// Rotate once an active file reaches this size
    pub max_file_size: u64,

    /// Rotate once the active files are this old
    pub rotate_interval: Option<Duration>,

    /// Write invalid readings (marked invalid) instead of skipping them
    pub log_invalid: bool,
}

#[derive(Debug)]
struct ActiveFile {
    format: LogFormat,
    path: PathBuf,
    out: BufWriter<File>,
    bytes: u64,
}

impl ActiveFile {
    fn append(&mut self, line: &str) -> std::io::Result<()> {
        self.out.write_all(line.as_bytes())?;
        self.out.flush()?;
        self.bytes += line.len() as u64;
        Ok(())
    }

    /// Cut the file back to `len` bytes
    fn truncate(&mut self, len: u64) -> std::io::Result<()> {
        self.out.get_ref().set_len(len)?;
        self.bytes = len;
        Ok(())
    }

    /// Close without writing out buffered bytes of a failed record
    fn discard(self) {
        let (_file, unwritten) = self.out.into_parts();
        if let Ok(buffered) = unwritten {
            if !buffered.is_empty() {
                debug!("Discarded {} unwritten bytes for {}", buffered.len(), self.path.display());
            }
        }
    }
}

/// Rotating writer for the data logs
#[derive(Debug)]
pub struct LogWriter {
    options: WriterOptions,
    table: ParameterTable,
    active: Vec<ActiveFile>,
    opened_at: Instant,
    files: Vec<PathBuf>,
    written: u64,
    /// A write failed; reopen fresh files before the next write
    broken: bool,
}

impl LogWriter {
    /// Create the log directory and open the first set of files
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the directory cannot be created or the
    /// files cannot be opened; at startup this is a configuration problem.
    pub fn open(options: WriterOptions, table: ParameterTable) -> Result<Self> {
        Self::open_at(options, table, Instant::now())
    }

    pub(crate) fn open_at(
        options: WriterOptions,
        table: ParameterTable,
        now: Instant,
    ) -> Result<Self> {
        fs::create_dir_all(&options.dir).map_err(|e| {
            LoggerError::InvalidConfig(format!(
                "cannot create log directory {}: {}",
                options.dir.display(),
                e
            ))
        })?;

        let mut writer = Self {
            options,
            table,
            active: Vec::new(),
            opened_at: now,
            files: Vec::new(),
            written: 0,
            broken: false,
        };

        writer.active = writer.open_set().map_err(|e| match e {
            LoggerError::LogWrite(msg) => LoggerError::InvalidConfig(msg),
            other => other,
        })?;

        Ok(writer)
    }

    /// Append a reading to every active file
    ///
    /// # Returns
    ///
    /// * `Result<bool>` - `false` if the reading was skipped (invalid with
    ///   `log_invalid` off)
    ///
    /// # Errors
    ///
    /// Returns `LogWrite` if rotation or the write failed. Files the reading
    /// already reached are truncated back, so a failed reading is in none of
    /// the logs.
    pub fn write(&mut self, reading: &Reading) -> Result<bool> {
        self.write_at(reading, Instant::now())
    }

    pub(crate) fn write_at(&mut self, reading: &Reading, now: Instant) -> Result<bool> {
        if !reading.is_valid() && !self.options.log_invalid {
            return Ok(false);
        }

        if self.broken || self.needs_rotation(now) {
            self.rotate_at(now)?;
        }

        let marks: Vec<u64> = self.active.iter().map(|f| f.bytes).collect();
        let table = &self.table;
        let failure = self.active.iter_mut().find_map(|file| {
            let line = file.format.record(table, reading);
            file.append(&line)
                .err()
                .map(|e| format!("write to {} failed: {}", file.path.display(), e))
        });

        if let Some(msg) = failure {
            self.broken = true;
            for (file, &len) in self.active.iter_mut().zip(&marks) {
                if let Err(e) = file.truncate(len) {
                    warn!("Cannot roll back {}: {}", file.path.display(), e);
                }
            }
            return Err(LoggerError::LogWrite(msg));
        }

        self.written += 1;
        Ok(true)
    }

    fn needs_rotation(&self, now: Instant) -> bool {
        let too_big = self
            .active
            .iter()
            .any(|f| f.bytes >= self.options.max_file_size);
        let too_old = self
            .options
            .rotate_interval
            .is_some_and(|interval| now.duration_since(self.opened_at) >= interval);
        too_big || too_old
    }

    fn rotate_at(&mut self, now: Instant) -> Result<()> {
        let next = self.open_set()?;
        let previous = std::mem::replace(&mut self.active, next);
        self.opened_at = now;
        let broken = std::mem::replace(&mut self.broken, false);

        for mut file in previous {
            if broken {
                file.discard();
                continue;
            }
            match file.out.flush() {
                Ok(()) => debug!("Closed log file {} ({} bytes)", file.path.display(), file.bytes),
                Err(e) => warn!("Failed to flush {} on rotation: {}", file.path.display(), e),
            }
        }

        info!(
            "Rotated data logs: {}",
            self.active
                .iter()
                .map(|f| f.path.display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        );
        Ok(())
    }

    fn open_set(&mut self) -> Result<Vec<ActiveFile>> {
        let created = Local::now();
        let mut set = Vec::with_capacity(self.options.formats.len());

        for &format in &self.options.formats {
            let path = unique_path(
                &self.options.dir,
                &self.options.prefix,
                format.kind(),
                format.extension(),
                &created,
                &self.files,
            );

            let file = OpenOptions::new()
                .create_new(true)
                .append(true)
                .open(&path)
                .map_err(|e| {
                    LoggerError::LogWrite(format!("cannot open {}: {}", path.display(), e))
                })?;

            let mut active = ActiveFile {
                format,
                path: path.clone(),
                out: BufWriter::new(file),
                bytes: 0,
            };

            if let Some(header) = format.header(&self.table) {
                active
                    .append(&header)
                    .map_err(|e| {
                        LoggerError::LogWrite(format!("cannot write {}: {}", path.display(), e))
                    })?;
            }

            debug!("Opened {} log {}", format, path.display());
            self.files.push(path);
            set.push(active);
        }

        Ok(set)
    }

    /// Flush and close the active files
    pub fn close(mut self) -> Result<()> {
        if self.broken {
            self.active.into_iter().for_each(ActiveFile::discard);
            return Ok(());
        }
        for file in &mut self.active {
            file.out.flush().map_err(|e| {
                LoggerError::LogWrite(format!("flush of {} failed: {}", file.path.display(), e))
            })?;
        }
        Ok(())
    }

    /// Every data file created so far, in creation order
    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    /// Paths of the files currently being written
    pub fn active_paths(&self) -> Vec<PathBuf> {
        self.active.iter().map(|f| f.path.clone()).collect()
    }

    /// Readings written since open
    pub fn written(&self) -> u64 {
        self.written
    }
}
