//! ==============================================================================
//! persistence.rs - queued snapshots to dated csv files
//! ==============================================================================
//!
//! purpose:
//!     drains the snapshot queue on its own worker and appends each snapshot
//!     to `weather_data_YYYY-MM-DD.csv` (date taken from the capture time).
//!
//! rules:
//!     - one file per calendar day, header row written when the file is created
//!     - on rollover (first write of a day) files older than the retention
//!       window are pruned; unrelated files in the directory are left alone
//!     - a failed write is logged and skipped; permission errors also back off
//!     - the worker checks the running flag once per pop and drains whatever
//!       is still queued before it exits
//!
//! relationships:
//!     - fed by: acquisition.rs (QueueProducer::push)
//!     - uses: snapshot.rs (Metric table = column order)
//!
//! ==============================================================================

use chrono::NaiveDate;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;

use crate::error::StorageError;
use crate::snapshot::{Metric, Snapshot};

const FILE_PREFIX: &str = "weather_data_";
const FILE_SUFFIX: &str = ".csv";

// ==============================================================================
// queue
// ==============================================================================

/// producer half: never blocks
#[derive(Clone)]
pub struct QueueProducer {
    tx: mpsc::Sender<Snapshot>,
}

/// consumer half: blocking pop with a timeout
pub struct QueueConsumer {
    rx: mpsc::Receiver<Snapshot>,
}

pub fn snapshot_queue() -> (QueueProducer, QueueConsumer) {
    let (tx, rx) = mpsc::channel();
    (QueueProducer { tx }, QueueConsumer { rx })
}

impl QueueProducer {
    /// false when the writer has gone away
    pub fn push(&self, snapshot: Snapshot) -> bool {
        self.tx.send(snapshot).is_ok()
    }
}

impl QueueConsumer {
    pub fn pop_timeout(&self, timeout: Duration) -> Result<Snapshot, RecvTimeoutError> {
        self.rx.recv_timeout(timeout)
    }

    pub fn drain(&self) -> Vec<Snapshot> {
        self.rx.try_iter().collect()
    }
}

// ==============================================================================
// daily file writer
// ==============================================================================

pub fn file_name(date: NaiveDate) -> String {
    format!("{FILE_PREFIX}{}{FILE_SUFFIX}", date.format("%Y-%m-%d"))
}

fn file_date(name: &str) -> Option<NaiveDate> {
    let date = name.strip_prefix(FILE_PREFIX)?.strip_suffix(FILE_SUFFIX)?;
    NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
}

pub struct DailyCsvWriter {
    dir: PathBuf,
    retention_days: i64,
    current_day: Option<NaiveDate>,
}

impl DailyCsvWriter {
    pub fn new(dir: impl Into<PathBuf>, retention_days: i64) -> Self {
        Self { dir: dir.into(), retention_days, current_day: None }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn write(&mut self, snapshot: &Snapshot) -> Result<(), StorageError> {
        let day = snapshot.captured_at.date_naive();
        std::fs::create_dir_all(&self.dir)?;

        let path = self.dir.join(file_name(day));
        let is_new = !path.exists();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let mut writer = csv::Writer::from_writer(file);
        if is_new {
            writer.write_record(Metric::header())?;
            tracing::info!(file = %path.display(), "started new daily data file");
        }
        writer.write_record(Metric::row(snapshot))?;
        writer.flush()?;

        if self.current_day != Some(day) {
            self.current_day = Some(day);
            self.prune(day);
        }
        Ok(())
    }

    /// remove data files dated more than `retention_days` before `today`
    pub fn prune(&self, today: NaiveDate) -> usize {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::error!(dir = %self.dir.display(), error = %e, "cannot list data directory");
                return 0;
            }
        };

        let mut removed = 0;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(date) = name.to_str().and_then(file_date) else {
                continue;
            };
            if (today - date).num_days() > self.retention_days {
                match std::fs::remove_file(entry.path()) {
                    Ok(()) => {
                        tracing::info!(file = ?name, "pruned expired data file");
                        removed += 1;
                    }
                    Err(e) => tracing::error!(file = ?name, error = %e, "failed to prune data file"),
                }
            }
        }
        removed
    }
}

// ==============================================================================
// worker
// ==============================================================================

pub struct WriterSettings {
    pub poll: Duration,
    pub permission_backoff: Duration,
}

fn persist(writer: &mut DailyCsvWriter, snapshot: &Snapshot, settings: &WriterSettings) {
    match writer.write(snapshot) {
        Ok(()) => tracing::debug!(at = %snapshot.captured_at, "snapshot persisted"),
        Err(e) if e.is_permission_denied() => {
            tracing::error!(error = %e, "permission denied writing data file, backing off");
            std::thread::sleep(settings.permission_backoff);
        }
        Err(e) => tracing::error!(error = %e, "data file write failed, snapshot skipped"),
    }
}

/// blocking worker loop; run it on a blocking thread
pub fn run_writer(
    mut writer: DailyCsvWriter,
    queue: QueueConsumer,
    running: Arc<AtomicBool>,
    settings: WriterSettings,
) {
    tracing::info!(dir = %writer.dir().display(), "persistence writer started");

    while running.load(Ordering::SeqCst) {
        match queue.pop_timeout(settings.poll) {
            Ok(snapshot) => persist(&mut writer, &snapshot, &settings),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    for snapshot in queue.drain() {
        persist(&mut writer, &snapshot, &settings);
    }
    tracing::info!("persistence writer stopped");
}
