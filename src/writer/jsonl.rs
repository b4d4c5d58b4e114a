//! # JSONL Storage
//!
//! Appends signals and frame snapshots to JSON Lines files:
//!
//! ```text
//! data/
//!   signals-000001.jsonl
//!   signals-000002.jsonl
//!   frames-000001.jsonl
//! ```
//!
//! A file is rotated after `max_records_per_file` lines and only the newest
//! `max_files_to_keep` files of each kind are retained.

use async_trait::async_trait;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

use super::storage::Storage;
use crate::config::StorageConfig;
use crate::error::{CartelemError, Result};
use crate::telemetry::{Envelope, FrameSnapshot};

const SIGNALS_PREFIX: &str = "signals";
const FRAMES_PREFIX: &str = "frames";

/// One family of numbered, size-capped files
#[derive(Debug)]
struct RotatingLog {
    dir: PathBuf,
    prefix: &'static str,
    max_records: usize,
    max_files: usize,
    index: u64,
    records: usize,
    file: Option<BufWriter<File>>,
}

impl RotatingLog {
    fn open(
        dir: &Path,
        prefix: &'static str,
        max_records: usize,
        max_files: usize,
    ) -> Result<Self> {
        let index = existing_indices(dir, prefix)?.last().copied().unwrap_or(0);
        Ok(Self {
            dir: dir.to_path_buf(),
            prefix,
            max_records: max_records.max(1),
            max_files: max_files.max(1),
            index,
            records: 0,
            file: None,
        })
    }

    fn path(&self, index: u64) -> PathBuf {
        file_path(&self.dir, self.prefix, index)
    }

    /// Append pre-serialized lines, rotating as needed
    fn append(&mut self, lines: &[String]) -> Result<()> {
        for line in lines {
            if self.file.is_none() || self.records >= self.max_records {
                self.rotate()?;
            }
            if let Some(file) = self.file.as_mut() {
                file.write_all(line.as_bytes())?;
                file.write_all(b"\n")?;
                self.records += 1;
            }
        }
        if let Some(file) = self.file.as_mut() {
            file.flush()?;
        }
        Ok(())
    }

    fn rotate(&mut self) -> Result<()> {
        if let Some(mut old) = self.file.take() {
            old.flush()?;
        }
        self.index += 1;
        let path = self.path(self.index);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        debug!("Opened {}", path.display());
        self.file = Some(BufWriter::new(file));
        self.records = 0;
        self.prune()
    }

    /// Delete the oldest files beyond the retention limit
    fn prune(&self) -> Result<()> {
        let indices = existing_indices(&self.dir, self.prefix)?;
        let excess = indices.len().saturating_sub(self.max_files);
        for index in indices.into_iter().take(excess) {
            let path = self.path(index);
            match fs::remove_file(&path) {
                Ok(()) => info!("Removed old log file {}", path.display()),
                Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
            }
        }
        Ok(())
    }
}

fn file_path(dir: &Path, prefix: &str, index: u64) -> PathBuf {
    dir.join(format!("{}-{:06}.jsonl", prefix, index))
}

/// Indices of `<prefix>-NNNNNN.jsonl` files in `dir`, ascending
fn existing_indices(dir: &Path, prefix: &str) -> Result<Vec<u64>> {
    let mut indices: Vec<u64> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let name = entry.file_name().into_string().ok()?;
            name.strip_prefix(prefix)?
                .strip_prefix('-')?
                .strip_suffix(".jsonl")?
                .parse()
                .ok()
        })
        .collect();
    indices.sort_unstable();
    Ok(indices)
}

fn to_lines<T: Serialize>(items: &[T]) -> Result<Vec<String>> {
    items
        .iter()
        .map(|item| serde_json::to_string(item).map_err(CartelemError::from))
        .collect()
}

/// File-backed [`Storage`]
#[derive(Debug, Clone)]
pub struct JsonlStorage {
    signals: Arc<Mutex<RotatingLog>>,
    frames: Arc<Mutex<RotatingLog>>,
}

impl JsonlStorage {
    /// Create the data directory if needed and continue numbering after
    /// any files already present
    pub fn open(config: &StorageConfig) -> Result<Self> {
        let dir = Path::new(&config.data_dir);
        fs::create_dir_all(dir)?;
        info!("Writing telemetry to {}", dir.display());

        let signals = RotatingLog::open(
            dir,
            SIGNALS_PREFIX,
            config.max_records_per_file,
            config.max_files_to_keep,
        )?;
        let frames = RotatingLog::open(
            dir,
            FRAMES_PREFIX,
            config.max_records_per_file,
            config.max_files_to_keep,
        )?;

        Ok(Self {
            signals: Arc::new(Mutex::new(signals)),
            frames: Arc::new(Mutex::new(frames)),
        })
    }

    async fn append(log: &Arc<Mutex<RotatingLog>>, lines: Vec<String>) -> Result<()> {
        let log = Arc::clone(log);
        tokio::task::spawn_blocking(move || {
            let mut log = log.lock().unwrap_or_else(PoisonError::into_inner);
            log.append(&lines)
        })
        .await
        .map_err(|e| CartelemError::StorageInsert(format!("writer task failed: {}", e)))?
        .map_err(|e| CartelemError::StorageInsert(e.to_string()))
    }
}

#[async_trait]
impl Storage for JsonlStorage {
    async fn insert_signals(&self, batch: &[Envelope]) -> Result<()> {
        let lines = to_lines(batch)?;
        Self::append(&self.signals, lines).await
    }

    async fn insert_frame(&self, frame: &FrameSnapshot) -> Result<()> {
        let lines = to_lines(std::slice::from_ref(frame))?;
        Self::append(&self.frames, lines).await
    }
}
