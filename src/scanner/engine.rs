//! Verification engine: the per-file decision against the stored baseline,
//! plus the scan driver that ties inventory, watchdog and reporting together.
//!
//! Decision for one path `p` at iteration `N`:
//! - no record: hash and insert at `N`;
//! - record already at `N` (or `p` already decided this run): skip;
//! - file gone: transient notice, no mutation;
//! - mtime equal: hash; equal hash is a match, different hash is a
//!   corruption alert and the record is left as it was;
//! - mtime different: hash and overwrite hash, mtime and iteration.
//!
//! Only a hash that ran to completion under a live cancel token may lead to a
//! write or an alert, and each path is claimed in the settled set right
//! before either happens, so a retried worker racing a cancelled one can
//! never double-report.
//!
//! Store access runs with the liveness clock paused: a baseline held by
//! another process is a store wait, not a stalled read.

#![allow(missing_docs)]

use std::collections::HashSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::core::errors::{BrsError, Result};
use crate::core::paths::record_key;
use crate::core::signals::SignalHandler;
use crate::logger::activity::{ActivityEvent, ActivityLoggerHandle};
use crate::scanner::hasher::ContentHasher;
use crate::scanner::inventory::{InventoryCollector, InventoryConfig, InventoryEntry};
use crate::scanner::progress::{CancelToken, Liveness, ScanProgress, Tally};
use crate::scanner::watchdog::{Watchdog, WatchdogSettings};
use crate::store::{BaselineStore, FileRecord, NewRecord, RecordUpdate, SharedStore};
use crate::store::baseline::format_ts;

// ──────────────────── results ────────────────────

/// Content changed while the modification time did not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CorruptionAlert {
    pub path: String,
    pub expected_hash: String,
    pub actual_hash: String,
    pub mtime: DateTime<Utc>,
    pub iteration: u64,
}

/// What happened to one queue entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Inserted,
    Updated,
    Matched,
    Alerted(CorruptionAlert),
    /// Already decided during this iteration.
    AlreadyProcessed,
    Vanished,
    HashFailed,
    /// Insert hit the unique path constraint.
    Rejected,
    StoreFailed,
    /// The worker was cancelled before it could commit anything.
    Cancelled,
}

impl Outcome {
    fn tally(&self) -> Option<Tally> {
        match self {
            Self::Inserted => Some(Tally::New),
            Self::Updated => Some(Tally::Updated),
            Self::Matched => Some(Tally::Matching),
            Self::Alerted(_) => Some(Tally::Alert),
            Self::Vanished | Self::HashFailed | Self::Rejected | Self::StoreFailed => {
                Some(Tally::Skipped)
            }
            // Duplicate queue entries and cancelled attempts are not files.
            Self::AlreadyProcessed | Self::Cancelled => None,
        }
    }
}

/// Summary of one scan run.
#[derive(Debug, Clone, Serialize)]
pub struct ScanReport {
    pub iteration: u64,
    pub root: PathBuf,
    pub total_files: u64,
    pub total_bytes: u64,
    pub files_processed: u64,
    pub bytes_processed: u64,
    pub new_records: u64,
    pub updated_records: u64,
    pub matching_records: u64,
    pub skipped: u64,
    /// Sorted by path.
    pub alerts: Vec<CorruptionAlert>,
    /// Files the watchdog requeued after a stall.
    pub retried: Vec<PathBuf>,
    /// Files dropped after stalling twice in a row.
    pub stall_skipped: Vec<PathBuf>,
    pub duration_ms: u64,
    pub interrupted: bool,
}

impl ScanReport {
    #[must_use]
    pub fn has_alerts(&self) -> bool {
        !self.alerts.is_empty()
    }
}

// ──────────────────── engine ────────────────────

/// Applies the decision rule for one iteration.
pub struct VerificationEngine {
    store: SharedStore,
    hasher: Arc<dyn ContentHasher>,
    logger: ActivityLoggerHandle,
    progress: Arc<ScanProgress>,
    iteration: u64,
    settled: Mutex<HashSet<String>>,
    alerts: Mutex<Vec<CorruptionAlert>>,
}

impl VerificationEngine {
    pub fn new(
        store: SharedStore,
        hasher: Arc<dyn ContentHasher>,
        logger: ActivityLoggerHandle,
        progress: Arc<ScanProgress>,
        iteration: u64,
    ) -> Self {
        Self {
            store,
            hasher,
            logger,
            progress,
            iteration,
            settled: Mutex::new(HashSet::new()),
            alerts: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    pub fn progress(&self) -> &Arc<ScanProgress> {
        &self.progress
    }

    pub fn logger(&self) -> &ActivityLoggerHandle {
        &self.logger
    }

    /// Alerts raised so far, sorted by path.
    #[must_use]
    pub fn alerts(&self) -> Vec<CorruptionAlert> {
        let mut alerts = self.alerts.lock().clone();
        alerts.sort_by(|a, b| a.path.cmp(&b.path));
        alerts
    }

    /// Decide one queue entry and count it.
    pub fn process_entry(&self, entry: &InventoryEntry, cancel: &CancelToken) -> Outcome {
        let outcome = self.decide(&entry.path, cancel);
        if let Some(tally) = outcome.tally() {
            self.progress.finish_file(entry.size_bytes, tally);
        }
        outcome
    }

    fn decide(&self, path: &Path, cancel: &CancelToken) -> Outcome {
        let Some(key) = record_key(path) else {
            return Outcome::HashFailed;
        };
        if self.settled.lock().contains(key) {
            return Outcome::AlreadyProcessed;
        }

        let existing = match self.with_store(|store| store.find_by_path(key)) {
            Ok(record) => record,
            Err(err) => return self.store_failed(key, &err),
        };

        let Some(record) = existing else {
            return self.insert_new(path, key, cancel);
        };

        if record.iteration >= self.iteration {
            return Outcome::AlreadyProcessed;
        }

        let mtime = match live_mtime(path) {
            Ok(Some(mtime)) => mtime,
            Ok(None) => return self.vanished(key),
            Err(err) => return self.hash_failed(key, &err),
        };

        let actual = match self.hash(path, key, cancel) {
            Ok(digest) => digest,
            Err(outcome) => return outcome,
        };

        if cancel.is_cancelled() {
            return Outcome::Cancelled;
        }
        if !self.claim(key) {
            return Outcome::AlreadyProcessed;
        }

        if mtime == record.mtime {
            if actual == record.content_hash {
                return Outcome::Matched;
            }
            let alert = CorruptionAlert {
                path: key.to_string(),
                expected_hash: record.content_hash,
                actual_hash: actual,
                mtime,
                iteration: self.iteration,
            };
            self.raise(&alert);
            return Outcome::Alerted(alert);
        }

        let update = RecordUpdate {
            content_hash: &actual,
            mtime,
            iteration: self.iteration,
        };
        match self.with_store(|store| store.update(key, &update)) {
            Ok(true) => Outcome::Updated,
            Ok(false) => {
                self.logger.send(ActivityEvent::StoreError {
                    path: Some(key.to_string()),
                    code: "BRS-2001".to_string(),
                    message: "record disappeared before update".to_string(),
                });
                Outcome::StoreFailed
            }
            Err(err) => self.store_failed(key, &err),
        }
    }

    fn insert_new(&self, path: &Path, key: &str, cancel: &CancelToken) -> Outcome {
        let mtime = match live_mtime(path) {
            Ok(Some(mtime)) => mtime,
            Ok(None) => return self.vanished(key),
            Err(err) => return self.hash_failed(key, &err),
        };
        let digest = match self.hash(path, key, cancel) {
            Ok(digest) => digest,
            Err(outcome) => return outcome,
        };

        if cancel.is_cancelled() {
            return Outcome::Cancelled;
        }
        if !self.claim(key) {
            return Outcome::AlreadyProcessed;
        }

        let record = NewRecord {
            path: key,
            content_hash: &digest,
            mtime,
            iteration: self.iteration,
        };
        match self.with_store(|store| store.insert(&record)) {
            Ok(_) => Outcome::Inserted,
            Err(BrsError::DuplicatePath { path }) => {
                self.logger.send(ActivityEvent::DuplicateRecord { path });
                Outcome::Rejected
            }
            Err(err) => self.store_failed(key, &err),
        }
    }

    fn hash(
        &self,
        path: &Path,
        key: &str,
        cancel: &CancelToken,
    ) -> std::result::Result<String, Outcome> {
        match self.hasher.hash(path, self.progress.liveness(), cancel) {
            Ok(digest) => Ok(digest),
            Err(BrsError::Cancelled { .. }) => Err(Outcome::Cancelled),
            Err(BrsError::Io { source, .. }) if source.kind() == ErrorKind::NotFound => {
                Err(self.vanished(key))
            }
            Err(err) => Err(self.hash_failed(key, &err)),
        }
    }

    /// Run `op` on the store with the stall clock paused, including the
    /// wait for the store mutex.
    fn with_store<T>(&self, op: impl FnOnce(&BaselineStore) -> T) -> T {
        let _paused = self.progress.liveness().pause();
        let store = self.store.lock();
        op(&store)
    }

    /// Mark `key` decided for this iteration. False if someone else got there.
    fn claim(&self, key: &str) -> bool {
        self.settled.lock().insert(key.to_string())
    }

    fn raise(&self, alert: &CorruptionAlert) {
        self.alerts.lock().push(alert.clone());
        self.logger.send_critical(ActivityEvent::CorruptionAlert {
            iteration: alert.iteration,
            path: alert.path.clone(),
            expected_hash: alert.expected_hash.clone(),
            actual_hash: alert.actual_hash.clone(),
            mtime: format_ts(alert.mtime),
        });
    }

    fn vanished(&self, key: &str) -> Outcome {
        self.claim(key);
        self.logger.send(ActivityEvent::TransientFile {
            path: key.to_string(),
        });
        Outcome::Vanished
    }

    fn hash_failed(&self, key: &str, err: &BrsError) -> Outcome {
        self.claim(key);
        self.logger.send(ActivityEvent::HashFailed {
            path: key.to_string(),
            error_code: err.code().to_string(),
            error_message: err.to_string(),
        });
        Outcome::HashFailed
    }

    fn store_failed(&self, key: &str, err: &BrsError) -> Outcome {
        self.logger.send(ActivityEvent::StoreError {
            path: Some(key.to_string()),
            code: err.code().to_string(),
            message: err.to_string(),
        });
        Outcome::StoreFailed
    }
}

/// Live modification time, `None` when the file is gone.
fn live_mtime(path: &Path) -> Result<Option<DateTime<Utc>>> {
    match fs::metadata(path) {
        Ok(meta) => {
            let modified = meta.modified().map_err(|source| BrsError::io(path, source))?;
            Ok(Some(DateTime::<Utc>::from(modified)))
        }
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(source) => Err(BrsError::io(path, source)),
    }
}

// ──────────────────── scan driver ────────────────────

/// Everything a scan run needs from its caller.
#[derive(Clone)]
pub struct ScanContext {
    pub store: SharedStore,
    pub hasher: Arc<dyn ContentHasher>,
    pub logger: ActivityLoggerHandle,
    pub progress: Arc<ScanProgress>,
    pub signals: SignalHandler,
}

#[derive(Debug, Clone)]
pub struct ScanSettings {
    pub inventory: InventoryConfig,
    pub watchdog: WatchdogSettings,
    /// Effective configuration fingerprint, recorded with the start event.
    pub config_hash: Option<String>,
}

/// Run one full scan: inventory, iteration bump, supervised verification.
///
/// Only a failing inventory root or an unusable store aborts; every per-file
/// problem is logged and the run continues.
pub fn run_scan(ctx: &ScanContext, settings: &ScanSettings) -> Result<ScanReport> {
    let started = Instant::now();

    let inventory =
        InventoryCollector::new(settings.inventory.clone()).collect(Some(&ctx.progress))?;
    let iteration = ctx.store.lock().increment_iteration()?;
    for path in &inventory.unrepresentable {
        ctx.logger.send(ActivityEvent::PathSkipped {
            path: path.display().to_string(),
            reason: "path has no UTF-8 form".to_string(),
        });
    }

    ctx.logger.send(ActivityEvent::ScanStarted {
        iteration,
        root: settings.inventory.root.display().to_string(),
        total_files: inventory.total_files,
        total_bytes: inventory.total_bytes,
        config_hash: settings.config_hash.clone(),
    });

    let engine = Arc::new(VerificationEngine::new(
        Arc::clone(&ctx.store),
        Arc::clone(&ctx.hasher),
        ctx.logger.clone(),
        Arc::clone(&ctx.progress),
        iteration,
    ));
    let summary = Watchdog::new(settings.watchdog).supervise(
        &engine,
        inventory.entries,
        &ctx.signals,
    )?;
    ctx.progress.set_current(None);

    let snap = ctx.progress.snapshot();
    #[allow(clippy::cast_possible_truncation)]
    let duration_ms = started.elapsed().as_millis() as u64;
    let report = ScanReport {
        iteration,
        root: settings.inventory.root.clone(),
        total_files: snap.total_files,
        total_bytes: snap.total_bytes,
        files_processed: snap.files_processed,
        bytes_processed: snap.bytes_processed,
        new_records: snap.new_records,
        updated_records: snap.updated_records,
        matching_records: snap.matching_records,
        skipped: snap.skipped + inventory.skipped,
        alerts: engine.alerts(),
        retried: summary.retried,
        stall_skipped: summary.skipped,
        duration_ms,
        interrupted: summary.interrupted,
    };

    ctx.logger.send_critical(ActivityEvent::ScanCompleted {
        iteration,
        files: report.files_processed,
        new_records: report.new_records,
        updated_records: report.updated_records,
        matching_records: report.matching_records,
        alerts: report.alerts.len() as u64,
        skipped: report.skipped,
        duration_ms,
        interrupted: report.interrupted,
    });

    Ok(report)
}

// ──────────────────── acknowledgement ────────────────────

/// Re-baseline one file after an investigator has reviewed its alert.
///
/// Rehashes the live file and overwrites hash, mtime and iteration. This is
/// the only way an alerted record changes while its mtime stays put.
pub fn accept_baseline(
    store: &SharedStore,
    hasher: &dyn ContentHasher,
    logger: &ActivityLoggerHandle,
    path: &Path,
) -> Result<FileRecord> {
    let key = record_key(path).ok_or_else(|| BrsError::Runtime {
        details: format!("path has no UTF-8 form: {}", path.display()),
    })?;
    let iteration = {
        let guard = store.lock();
        if guard.find_by_path(key)?.is_none() {
            return Err(BrsError::Runtime {
                details: format!("no baseline record for {key}"),
            });
        }
        guard.iteration()?
    };

    let mtime = live_mtime(path)?.ok_or_else(|| {
        BrsError::io(path, std::io::Error::from(ErrorKind::NotFound))
    })?;
    let digest = hasher.hash(path, &Liveness::new(), &CancelToken::new())?;

    let guard = store.lock();
    guard.update(
        key,
        &RecordUpdate {
            content_hash: &digest,
            mtime,
            iteration,
        },
    )?;
    let record = guard.find_by_path(key)?.ok_or_else(|| BrsError::Runtime {
        details: format!("record for {key} vanished during accept"),
    })?;
    drop(guard);

    logger.send(ActivityEvent::BaselineAccepted {
        path: key.to_string(),
        content_hash: digest,
    });
    Ok(record)
}
