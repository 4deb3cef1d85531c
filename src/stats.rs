//! Per-attempt statistics written as JSON lines.

use log::warn;
use parking_lot::Mutex;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// One attempt of one logical request.
#[derive(Debug, Clone, Serialize)]
pub struct AttemptRecord {
    pub method: String,
    pub url: String,
    /// Zero-based index of this attempt.
    pub attempt: usize,
    pub max_attempts: usize,
    pub proxy: String,
    pub requests: usize,
    pub errors: usize,
    pub seq_errors: usize,
    /// Seconds the attempt took, excluding the throttle wait.
    pub elapsed_secs: f64,
    pub status: Option<u16>,
    /// Empty on success.
    pub outcome: String,
    /// Unix timestamp in seconds.
    pub timestamp: f64,
}

/// Receives attempt records. Implementations must not fail the request.
pub trait StatsSink: Send + Sync {
    fn record(&self, record: &AttemptRecord);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl StatsSink for NullSink {
    fn record(&self, _record: &AttemptRecord) {}
}

/// Appends one JSON object per attempt to a file.
///
/// Each record is a single small write plus flush under a lock, done inline
/// on the calling task. That blocks the runtime thread for the duration of the
/// write; acceptable for a local file, not for slow or network storage.
#[derive(Debug)]
pub struct JsonLinesSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonLinesSink {
    /// Open `proxy_stats_<unix-secs>.jsonl` in `dir`, creating the directory.
    pub fn create(dir: impl AsRef<Path>) -> io::Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("proxy_stats_{}.jsonl", unix_now() as u64));
        Self::open(path)
    }

    /// Append to an explicit file.
    pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StatsSink for JsonLinesSink {
    fn record(&self, record: &AttemptRecord) {
        let line = match serde_json::to_string(record) {
            Ok(line) => line,
            Err(e) => {
                warn!("Failed to encode attempt record: {}", e);
                return;
            }
        };
        let mut file = self.file.lock();
        if let Err(e) = writeln!(file, "{}", line).and_then(|_| file.flush()) {
            warn!("Failed to write stats to {}: {}", self.path.display(), e);
        }
    }
}

pub(crate) fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}
