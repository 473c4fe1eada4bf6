//! Checkpoint state management for resumable searches.
//!
//! A checkpoint stores the retired frontier (every value below it has been
//! checked) and the record. Saves write a temporary file next to the
//! target, sync it, rename it over the target and sync the directory, so a
//! crash leaves either the previous or the new checkpoint intact.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::record::RecordState;
use crate::types::{u128_string, TestValue, MIN_TEST_VALUE};
use crate::{Error, Result};

/// Persisted search position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Checkpoint format version.
    pub version: u32,
    /// First value not yet retired.
    #[serde(with = "u128_string")]
    pub cursor: TestValue,
    /// Best record so far.
    pub record: RecordState,
    /// Batches retired across all runs.
    pub batches_retired: u64,
    /// Last update, milliseconds since the epoch.
    pub updated_at_ms: u64,
}

impl Default for Checkpoint {
    fn default() -> Self {
        Self::fresh()
    }
}

impl Checkpoint {
    /// Current checkpoint format version.
    pub const VERSION: u32 = 1;

    /// State of a search that has not started.
    pub fn fresh() -> Self {
        Self {
            version: Self::VERSION,
            cursor: MIN_TEST_VALUE,
            record: RecordState::default(),
            batches_retired: 0,
            updated_at_ms: now_ms(),
        }
    }

    /// Creates a checkpoint at the given frontier.
    pub fn at(cursor: TestValue, record: RecordState, batches_retired: u64) -> Self {
        Self {
            version: Self::VERSION,
            cursor,
            record,
            batches_retired,
            updated_at_ms: now_ms(),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.version != Self::VERSION {
            return Err(Error::CorruptedCheckpoint(format!(
                "version mismatch: expected {}, got {}",
                Self::VERSION,
                self.version
            )));
        }
        if self.cursor < MIN_TEST_VALUE || self.cursor % 2 == 0 {
            return Err(Error::CorruptedCheckpoint(format!(
                "cursor {} is not an odd value >= {}",
                self.cursor, MIN_TEST_VALUE
            )));
        }
        if self.record.best_value >= self.cursor && self.record.best_steps > 0 {
            return Err(Error::CorruptedCheckpoint(format!(
                "record {} lies beyond cursor {}",
                self.record.best_value, self.cursor
            )));
        }
        Ok(())
    }

    /// Saves the checkpoint atomically.
    pub fn save(&self, path: &Path) -> Result<()> {
        let temp_path = path.with_extension("tmp");

        let file = File::create(&temp_path).map_err(|e| Error::checkpoint(&temp_path, &e))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, self)?;
        writer
            .flush()
            .map_err(|e| Error::checkpoint(&temp_path, &e))?;
        let file = writer
            .into_inner()
            .map_err(|e| Error::checkpoint(&temp_path, e.error()))?;
        file.sync_all()
            .map_err(|e| Error::checkpoint(&temp_path, &e))?;
        drop(file);

        fs::rename(&temp_path, path).map_err(|e| Error::checkpoint(path, &e))?;
        sync_parent(path).map_err(|e| Error::checkpoint(path, &e))?;
        Ok(())
    }

    /// Loads and validates a checkpoint.
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| Error::checkpoint(path, &e))?;
        let checkpoint: Self = serde_json::from_reader(BufReader::new(file))
            .map_err(|e| Error::CorruptedCheckpoint(format!("failed to parse: {}", e)))?;
        checkpoint.validate()?;
        Ok(checkpoint)
    }

    /// Loads the checkpoint, falling back to a fresh start.
    ///
    /// A missing, unreadable or invalid file is never fatal.
    pub fn load_or_fresh(path: &Path, restart: bool) -> Self {
        if restart {
            info!("restart requested, ignoring {}", path.display());
            return Self::fresh();
        }
        match Self::load(path) {
            Ok(checkpoint) => {
                info!(
                    cursor = %checkpoint.cursor,
                    record = %checkpoint.record,
                    "resuming from {}",
                    path.display()
                );
                checkpoint
            }
            Err(e) if e.io_kind() == Some(crate::IoKind::NotFound) => {
                debug!("no checkpoint at {}, starting fresh", path.display());
                Self::fresh()
            }
            Err(e) => {
                warn!(error = %e, "discarding checkpoint {}, starting fresh", path.display());
                Self::fresh()
            }
        }
    }
}

/// Persists the directory entry of `path` after a rename.
#[cfg(unix)]
fn sync_parent(path: &Path) -> std::io::Result<()> {
    let parent = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    File::open(parent)?.sync_all()
}

#[cfg(not(unix))]
fn sync_parent(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}

enum Job {
    Save(Checkpoint),
    Stop,
}

/// Writes checkpoints, optionally from a background thread.
///
/// Periodic saves are fire-and-forget: failures are logged and the next
/// request retries. [`CheckpointWriter::finish`] writes the final checkpoint
/// synchronously and reports its outcome. Only saves that reached the disk
/// are counted as written; coalesced requests count once.
pub struct CheckpointWriter {
    path: PathBuf,
    worker: Option<(Sender<Job>, JoinHandle<()>)>,
    written: Arc<AtomicU64>,
}

impl CheckpointWriter {
    /// Writes on the calling thread.
    pub fn inline(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            worker: None,
            written: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Writes from a dedicated I/O thread.
    pub fn background(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let (tx, rx) = mpsc::channel();
        let written = Arc::new(AtomicU64::new(0));
        let worker_path = path.clone();
        let worker_written = Arc::clone(&written);
        let handle = thread::Builder::new()
            .name("hailstone-checkpoint".into())
            .spawn(move || run_worker(&worker_path, rx, &worker_written))?;
        Ok(Self {
            path,
            worker: Some((tx, handle)),
            written,
        })
    }

    /// Checkpoint file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Checkpoints successfully written so far.
    ///
    /// Background saves still queued are not counted until they land.
    pub fn written(&self) -> u64 {
        self.written.load(Ordering::Acquire)
    }

    /// Requests a periodic save.
    pub fn request(&mut self, checkpoint: Checkpoint) {
        if let Some((tx, _)) = &self.worker {
            if tx.send(Job::Save(checkpoint.clone())).is_ok() {
                return;
            }
            warn!("checkpoint thread is gone, writing inline");
        }
        match checkpoint.save(&self.path) {
            Ok(()) => {
                self.written.fetch_add(1, Ordering::AcqRel);
            }
            Err(e) => warn!(error = %e, "checkpoint write failed, will retry"),
        }
    }

    /// Stops the worker and writes the final checkpoint.
    ///
    /// [`CheckpointWriter::written`] includes the final save afterwards if
    /// it succeeded.
    pub fn finish(&mut self, checkpoint: &Checkpoint) -> Result<()> {
        self.shutdown();
        checkpoint.save(&self.path)?;
        self.written.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn shutdown(&mut self) {
        if let Some((tx, handle)) = self.worker.take() {
            let _ = tx.send(Job::Stop);
            if handle.join().is_err() {
                warn!("checkpoint thread panicked");
            }
        }
    }
}

impl Drop for CheckpointWriter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker(path: &Path, rx: Receiver<Job>, written: &AtomicU64) {
    while let Ok(job) = rx.recv() {
        let Job::Save(mut latest) = job else {
            return;
        };
        // Coalesce a backlog down to the newest request.
        let mut stop = false;
        for job in rx.try_iter() {
            match job {
                Job::Save(next) => latest = next,
                Job::Stop => {
                    stop = true;
                    break;
                }
            }
        }
        match latest.save(path) {
            Ok(()) => {
                written.fetch_add(1, Ordering::AcqRel);
                debug!(cursor = %latest.cursor, "checkpoint written");
            }
            Err(e) => warn!(error = %e, "checkpoint write failed, will retry"),
        }
        if stop {
            return;
        }
    }
}
