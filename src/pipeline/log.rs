//! Per-job log files.
//!
//! Every pipeline job owns one append-only log file; stage code writes the
//! same milestones it emits as tracing events, and the jobs API serves the
//! tail of this file.

use chrono::Utc;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::types::Result;

/// Append-only writer for one job's log file.
pub struct JobLog {
    file: Mutex<Option<File>>,
    path: Option<PathBuf>,
}

impl JobLog {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(Some(file)),
            path: Some(path.to_path_buf()),
        })
    }

    /// A log that discards everything; used by tests and ad-hoc runs.
    pub fn disabled() -> Self {
        Self {
            file: Mutex::new(None),
            path: None,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn write(&self, level: &str, message: &str) {
        let mut guard = self.file.lock();
        if let Some(file) = guard.as_mut() {
            let line = format!("{} {level} {message}\n", Utc::now().to_rfc3339());
            let _ = file.write_all(line.as_bytes());
        }
    }

    pub fn info(&self, message: impl AsRef<str>) {
        let message = message.as_ref();
        tracing::info!("{message}");
        self.write("INFO", message);
    }

    pub fn warn(&self, message: impl AsRef<str>) {
        let message = message.as_ref();
        tracing::warn!("{message}");
        self.write("WARN", message);
    }

    pub fn error(&self, message: impl AsRef<str>) {
        let message = message.as_ref();
        tracing::error!("{message}");
        self.write("ERROR", message);
    }
}

/// Read the last `lines` lines of a log file; missing files read as empty.
pub fn tail_file(path: &Path, lines: usize) -> String {
    if lines == 0 {
        return String::new();
    }
    let Ok(content) = std::fs::read_to_string(path) else {
        return String::new();
    };
    let all: Vec<&str> = content.lines().collect();
    let from = all.len().saturating_sub(lines);
    all[from..].join("\n")
}
