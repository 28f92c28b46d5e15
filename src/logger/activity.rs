//! Activity logger: a dedicated thread owns the `JsonlWriter`; scanners send
//! `ActivityEvent`s through a bounded crossbeam channel.
//!
//! Routine notices use `send()`, which never blocks and counts what it drops.
//! Corruption alerts use `send_critical()`, which blocks until the logger has
//! room, so an alert is never lost to back-pressure.

#![allow(missing_docs)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use serde_json::json;

use crate::core::errors::{BrsError, Result};
use crate::logger::jsonl::{EventType, JsonlConfig, JsonlWriter, LogEntry, Severity};

/// Default bounded channel capacity for log events.
const CHANNEL_CAPACITY: usize = 1024;

// ──────────────────── public event type ────────────────────

/// Everything the scanner and pruner report.
#[derive(Debug, Clone)]
pub enum ActivityEvent {
    ScanStarted {
        iteration: u64,
        root: String,
        total_files: u64,
        total_bytes: u64,
        config_hash: Option<String>,
    },
    ScanCompleted {
        iteration: u64,
        files: u64,
        new_records: u64,
        updated_records: u64,
        matching_records: u64,
        alerts: u64,
        skipped: u64,
        duration_ms: u64,
        interrupted: bool,
    },
    CorruptionAlert {
        iteration: u64,
        path: String,
        expected_hash: String,
        actual_hash: String,
        mtime: String,
    },
    HashFailed {
        path: String,
        error_code: String,
        error_message: String,
    },
    /// File vanished between enumeration and processing.
    TransientFile {
        path: String,
    },
    StallRetry {
        path: String,
        idle_ms: u64,
    },
    StallSkip {
        path: String,
        idle_ms: u64,
    },
    DuplicateRecord {
        path: String,
    },
    /// Walked entry left out of the inventory.
    PathSkipped {
        path: String,
        reason: String,
    },
    /// Transient store failure that will be retried.
    StoreRetry {
        operation: String,
        attempt: u32,
        attempts: u32,
        message: String,
    },
    StoreError {
        path: Option<String>,
        code: String,
        message: String,
    },
    RecordPruned {
        path: String,
    },
    PruneCompleted {
        pattern: String,
        examined: u64,
        pruned: u64,
        duration_ms: u64,
        interrupted: bool,
    },
    BaselineAccepted {
        path: String,
        content_hash: String,
    },
    Error {
        code: String,
        message: String,
    },
    /// Sentinel to request graceful shutdown of the logger thread.
    Shutdown,
}

// ──────────────────── public handle ────────────────────

/// Cheaply cloneable handle for sending log events.
#[derive(Clone)]
pub struct ActivityLoggerHandle {
    tx: Sender<ActivityEvent>,
    dropped_events: Arc<AtomicU64>,
}

impl ActivityLoggerHandle {
    /// Send an event to the logger thread. Non-blocking; a full channel drops
    /// the event and bumps the dropped-events counter.
    pub fn send(&self, event: ActivityEvent) {
        if let Err(TrySendError::Full(_)) = self.tx.try_send(event) {
            self.dropped_events.fetch_add(1, Ordering::Relaxed);
        }
        // Disconnected is fine during shutdown.
    }

    /// Blocking send for events that must not be dropped.
    pub fn send_critical(&self, event: ActivityEvent) {
        let _ = self.tx.send(event);
    }

    /// Number of events dropped due to channel back-pressure.
    pub fn dropped_events(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    /// Request graceful shutdown. Join the thread handle to wait for the flush.
    pub fn shutdown(&self) {
        let _ = self.tx.send(ActivityEvent::Shutdown);
    }

    /// A handle that delivers events to the returned receiver instead of a
    /// logger thread.
    pub fn in_memory(capacity: usize) -> (Self, Receiver<ActivityEvent>) {
        let (tx, rx) = bounded(capacity.max(1));
        let handle = Self {
            tx,
            dropped_events: Arc::new(AtomicU64::new(0)),
        };
        (handle, rx)
    }

    /// A handle whose events go nowhere. Used by tests and library callers
    /// that do not want an activity log.
    pub fn disconnected() -> Self {
        let (tx, _rx) = bounded(1);
        Self {
            tx,
            dropped_events: Arc::new(AtomicU64::new(0)),
        }
    }
}

// ──────────────────── configuration ────────────────────

/// Options for the logger thread.
pub struct ActivityLoggerConfig {
    pub jsonl_config: JsonlConfig,
    pub channel_capacity: usize,
    /// Echo warnings and alerts to stderr as `[BRS-...]` notices.
    pub echo_stderr: bool,
    /// Only critical notices reach stderr.
    pub quiet: bool,
}

impl ActivityLoggerConfig {
    pub fn new(jsonl_config: JsonlConfig) -> Self {
        Self {
            jsonl_config,
            channel_capacity: CHANNEL_CAPACITY,
            echo_stderr: true,
            quiet: false,
        }
    }
}

// ──────────────────── spawn ────────────────────

/// Spawn the logger thread and return a handle plus its join handle.
///
/// The thread runs until `handle.shutdown()` is called or all senders drop.
pub fn spawn_logger(
    config: ActivityLoggerConfig,
) -> Result<(ActivityLoggerHandle, thread::JoinHandle<()>)> {
    let (tx, rx) = bounded::<ActivityEvent>(config.channel_capacity.max(1));
    let dropped = Arc::new(AtomicU64::new(0));
    let dropped_clone = Arc::clone(&dropped);

    let handle = ActivityLoggerHandle {
        tx,
        dropped_events: dropped,
    };

    let join = thread::Builder::new()
        .name("brs-logger".to_string())
        .spawn(move || {
            let echo = EchoPolicy {
                enabled: config.echo_stderr,
                quiet: config.quiet,
            };
            logger_thread_main(rx, config.jsonl_config, echo, dropped_clone);
        })
        .map_err(|e| BrsError::Runtime {
            details: format!("failed to spawn logger thread: {e}"),
        })?;

    Ok((handle, join))
}

// ──────────────────── logger thread ────────────────────

#[derive(Debug, Clone, Copy)]
struct EchoPolicy {
    enabled: bool,
    quiet: bool,
}

impl EchoPolicy {
    fn allows(self, severity: Severity) -> bool {
        self.enabled && (!self.quiet || severity == Severity::Critical)
    }
}

#[allow(clippy::needless_pass_by_value)]
fn logger_thread_main(
    rx: Receiver<ActivityEvent>,
    jsonl_config: JsonlConfig,
    echo: EchoPolicy,
    dropped: Arc<AtomicU64>,
) {
    let mut jsonl = JsonlWriter::open(jsonl_config);

    while let Ok(event) = rx.recv() {
        let d = dropped.swap(0, Ordering::Relaxed);
        if d > 0 {
            let mut warn = LogEntry::new(EventType::Error, Severity::Warning);
            warn.details = Some(format!("{d} log events dropped due to back-pressure"));
            jsonl.write_entry(&warn);
        }

        if matches!(event, ActivityEvent::Shutdown) {
            break;
        }

        let entry = event_to_log_entry(&event);
        if echo.allows(entry.severity)
            && let Some(line) = stderr_notice(&event)
        {
            eprintln!("{line}");
        }
        jsonl.write_entry(&entry);
        // Alerts are durable before the scan moves on.
        if entry.severity == Severity::Critical {
            jsonl.fsync();
        }
    }

    jsonl.flush();
    jsonl.fsync();
}

// ──────────────────── event conversion ────────────────────

fn stderr_notice(event: &ActivityEvent) -> Option<String> {
    match event {
        ActivityEvent::CorruptionAlert {
            path,
            expected_hash,
            actual_hash,
            mtime,
            ..
        } => Some(format!(
            "[BRS-ALERT] content changed with unchanged mtime {mtime}: {path} \
             (baseline {expected_hash}, now {actual_hash})"
        )),
        ActivityEvent::HashFailed {
            path,
            error_message,
            ..
        } => Some(format!("[BRS-HASH] cannot hash {path}: {error_message}")),
        ActivityEvent::TransientFile { path } => {
            Some(format!("[BRS-SCAN] file vanished before processing: {path}"))
        }
        ActivityEvent::StallRetry { path, idle_ms } => Some(format!(
            "[BRS-WATCHDOG] no progress for {idle_ms} ms on {path}, retrying"
        )),
        ActivityEvent::StallSkip { path, idle_ms } => Some(format!(
            "[BRS-WATCHDOG] stalled again after {idle_ms} ms on {path}, skipping"
        )),
        ActivityEvent::DuplicateRecord { path } => Some(format!(
            "[BRS-STORE] baseline already holds {path}, skipped for this run"
        )),
        ActivityEvent::PathSkipped { path, reason } => {
            Some(format!("[BRS-INVENTORY] skipping {path}: {reason}"))
        }
        ActivityEvent::StoreRetry {
            operation,
            attempt,
            attempts,
            message,
        } => Some(format!(
            "[BRS-STORE] {operation}: transient failure (attempt {attempt}/{attempts}): {message}"
        )),
        ActivityEvent::StoreError { path, message, .. } => Some(match path {
            Some(path) => format!("[BRS-STORE] {path}: {message}"),
            None => format!("[BRS-STORE] {message}"),
        }),
        ActivityEvent::Error { code, message } => Some(format!("[{code}] {message}")),
        _ => None,
    }
}

#[allow(clippy::too_many_lines)]
fn event_to_log_entry(event: &ActivityEvent) -> LogEntry {
    match event {
        ActivityEvent::ScanStarted {
            iteration,
            root,
            total_files,
            total_bytes,
            config_hash,
        } => {
            let mut e = LogEntry::new(EventType::ScanStart, Severity::Info);
            e.iteration = Some(*iteration);
            e.path = Some(root.clone());
            e.counts = Some(json!({ "total_files": total_files, "total_bytes": total_bytes }));
            e.details = config_hash.as_ref().map(|hash| format!("config_hash={hash}"));
            e
        }
        ActivityEvent::ScanCompleted {
            iteration,
            files,
            new_records,
            updated_records,
            matching_records,
            alerts,
            skipped,
            duration_ms,
            interrupted,
        } => {
            let severity = if *alerts > 0 {
                Severity::Warning
            } else {
                Severity::Info
            };
            let mut e = LogEntry::new(EventType::ScanComplete, severity);
            e.iteration = Some(*iteration);
            e.duration_ms = Some(*duration_ms);
            e.counts = Some(json!({
                "files": files,
                "new": new_records,
                "updated": updated_records,
                "matching": matching_records,
                "alerts": alerts,
                "skipped": skipped,
            }));
            e.ok = Some(!interrupted);
            if *interrupted {
                e.details = Some("interrupted".to_string());
            }
            e
        }
        ActivityEvent::CorruptionAlert {
            iteration,
            path,
            expected_hash,
            actual_hash,
            mtime,
        } => {
            let mut e = LogEntry::new(EventType::CorruptionAlert, Severity::Critical);
            e.iteration = Some(*iteration);
            e.path = Some(path.clone());
            e.expected_hash = Some(expected_hash.clone());
            e.actual_hash = Some(actual_hash.clone());
            e.mtime = Some(mtime.clone());
            e
        }
        ActivityEvent::HashFailed {
            path,
            error_code,
            error_message,
        } => {
            let mut e = LogEntry::new(EventType::HashFailed, Severity::Warning);
            e.path = Some(path.clone());
            e.ok = Some(false);
            e.error_code = Some(error_code.clone());
            e.error_message = Some(error_message.clone());
            e
        }
        ActivityEvent::TransientFile { path } => {
            let mut e = LogEntry::new(EventType::TransientFile, Severity::Info);
            e.path = Some(path.clone());
            e
        }
        ActivityEvent::StallRetry { path, idle_ms } => {
            let mut e = LogEntry::new(EventType::StallRetry, Severity::Warning);
            e.path = Some(path.clone());
            e.duration_ms = Some(*idle_ms);
            e
        }
        ActivityEvent::StallSkip { path, idle_ms } => {
            let mut e = LogEntry::new(EventType::StallSkip, Severity::Warning);
            e.path = Some(path.clone());
            e.duration_ms = Some(*idle_ms);
            e.ok = Some(false);
            e
        }
        ActivityEvent::DuplicateRecord { path } => {
            let mut e = LogEntry::new(EventType::DuplicateRecord, Severity::Warning);
            e.path = Some(path.clone());
            e.ok = Some(false);
            e
        }
        ActivityEvent::PathSkipped { path, reason } => {
            let mut e = LogEntry::new(EventType::PathSkipped, Severity::Warning);
            e.path = Some(path.clone());
            e.ok = Some(false);
            e.details = Some(reason.clone());
            e
        }
        ActivityEvent::StoreRetry {
            operation,
            attempt,
            attempts,
            message,
        } => {
            let mut e = LogEntry::new(EventType::StoreRetry, Severity::Warning);
            e.error_code = Some("BRS-2002".to_string());
            e.error_message = Some(message.clone());
            e.details = Some(format!("{operation} attempt {attempt}/{attempts}"));
            e
        }
        ActivityEvent::StoreError {
            path,
            code,
            message,
        } => {
            let mut e = LogEntry::new(EventType::StoreError, Severity::Warning);
            e.path.clone_from(path);
            e.ok = Some(false);
            e.error_code = Some(code.clone());
            e.error_message = Some(message.clone());
            e
        }
        ActivityEvent::RecordPruned { path } => {
            let mut e = LogEntry::new(EventType::RecordPruned, Severity::Info);
            e.path = Some(path.clone());
            e.ok = Some(true);
            e
        }
        ActivityEvent::PruneCompleted {
            pattern,
            examined,
            pruned,
            duration_ms,
            interrupted,
        } => {
            let mut e = LogEntry::new(EventType::PruneComplete, Severity::Info);
            e.duration_ms = Some(*duration_ms);
            e.details = Some(format!("pattern={pattern}"));
            e.counts = Some(json!({ "examined": examined, "pruned": pruned }));
            e.ok = Some(!interrupted);
            e
        }
        ActivityEvent::BaselineAccepted { path, content_hash } => {
            let mut e = LogEntry::new(EventType::BaselineAccepted, Severity::Info);
            e.path = Some(path.clone());
            e.actual_hash = Some(content_hash.clone());
            e.ok = Some(true);
            e
        }
        ActivityEvent::Error { code, message } => {
            let mut e = LogEntry::new(EventType::Error, Severity::Critical);
            e.error_code = Some(code.clone());
            e.error_message = Some(message.clone());
            e.ok = Some(false);
            e
        }
        ActivityEvent::Shutdown => LogEntry::new(EventType::ScanComplete, Severity::Info),
    }
}

// ──────────────────── tests ────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(dir: &std::path::Path, capacity: usize) -> ActivityLoggerConfig {
        ActivityLoggerConfig {
            jsonl_config: JsonlConfig {
                path: dir.join("test.jsonl"),
                fallback_path: None,
                max_size_bytes: 10 * 1024 * 1024,
                max_rotated_files: 3,
                fsync_interval_secs: 60,
            },
            channel_capacity: capacity,
            echo_stderr: false,
            quiet: false,
        }
    }

    #[test]
    fn spawn_and_shutdown_flushes() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, join) = spawn_logger(test_config(dir.path(), 64)).unwrap();
        handle.send(ActivityEvent::ScanStarted {
            iteration: 1,
            root: "/data".to_string(),
            total_files: 3,
            total_bytes: 30,
            config_hash: Some("00ff".to_string()),
        });
        handle.shutdown();
        join.join().unwrap();

        let contents = std::fs::read_to_string(dir.path().join("test.jsonl")).unwrap();
        assert!(contents.contains("scan_start"));
    }

    #[test]
    fn alerts_are_critical_lines_with_both_hashes() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, join) = spawn_logger(test_config(dir.path(), 64)).unwrap();
        handle.send_critical(ActivityEvent::CorruptionAlert {
            iteration: 4,
            path: "/a/f.txt".to_string(),
            expected_hash: "H1".to_string(),
            actual_hash: "H2".to_string(),
            mtime: "2026-01-01T00:00:00Z".to_string(),
        });
        handle.shutdown();
        join.join().unwrap();

        let contents = std::fs::read_to_string(dir.path().join("test.jsonl")).unwrap();
        let line: serde_json::Value = serde_json::from_str(contents.trim()).unwrap();
        assert_eq!(line["event"], "corruption_alert");
        assert_eq!(line["severity"], "critical");
        assert_eq!(line["expected_hash"], "H1");
        assert_eq!(line["actual_hash"], "H2");
        assert_eq!(line["iteration"], 4);
    }

    #[test]
    fn clones_share_one_log() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, join) = spawn_logger(test_config(dir.path(), 64)).unwrap();
        let h2 = handle.clone();
        handle.send(ActivityEvent::TransientFile {
            path: "/gone".to_string(),
        });
        h2.send(ActivityEvent::RecordPruned {
            path: "/old".to_string(),
        });
        handle.shutdown();
        join.join().unwrap();

        let contents = std::fs::read_to_string(dir.path().join("test.jsonl")).unwrap();
        assert_eq!(contents.lines().count(), 2);
    }

    #[test]
    fn disconnected_handle_swallows_events() {
        let handle = ActivityLoggerHandle::disconnected();
        handle.send(ActivityEvent::Error {
            code: "BRS-3900".to_string(),
            message: "nobody listens".to_string(),
        });
        handle.send_critical(ActivityEvent::TransientFile {
            path: "/x".to_string(),
        });
        assert_eq!(handle.dropped_events(), 0);
    }

    #[test]
    fn in_memory_handle_delivers_events() {
        let (handle, rx) = ActivityLoggerHandle::in_memory(4);
        handle.send(ActivityEvent::PathSkipped {
            path: "/odd".to_string(),
            reason: "no UTF-8 form".to_string(),
        });
        assert!(matches!(
            rx.try_recv(),
            Ok(ActivityEvent::PathSkipped { path, .. }) if path == "/odd"
        ));
    }

    #[test]
    fn store_retries_and_skipped_paths_are_logged_as_warnings() {
        let retry = event_to_log_entry(&ActivityEvent::StoreRetry {
            operation: "insert".to_string(),
            attempt: 1,
            attempts: 5,
            message: "database is locked".to_string(),
        });
        assert_eq!(retry.event, EventType::StoreRetry);
        assert_eq!(retry.severity, Severity::Warning);

        let skipped = ActivityEvent::PathSkipped {
            path: "/odd".to_string(),
            reason: "no UTF-8 form".to_string(),
        };
        assert_eq!(event_to_log_entry(&skipped).severity, Severity::Warning);
        assert!(
            stderr_notice(&skipped).is_some_and(|line| line.starts_with("[BRS-INVENTORY]"))
        );
        // Warnings stay off stderr under --quiet.
        let quiet = EchoPolicy {
            enabled: true,
            quiet: true,
        };
        assert!(!quiet.allows(event_to_log_entry(&skipped).severity));
    }

    #[test]
    fn quiet_echo_keeps_only_critical() {
        let quiet = EchoPolicy {
            enabled: true,
            quiet: true,
        };
        assert!(quiet.allows(Severity::Critical));
        assert!(!quiet.allows(Severity::Warning));
        let off = EchoPolicy {
            enabled: false,
            quiet: false,
        };
        assert!(!off.allows(Severity::Critical));
    }

    #[test]
    fn stderr_notice_only_for_noteworthy_events() {
        assert!(
            stderr_notice(&ActivityEvent::StallSkip {
                path: "/slow".to_string(),
                idle_ms: 5000,
            })
            .is_some_and(|line| line.starts_with("[BRS-WATCHDOG]"))
        );
        assert!(
            stderr_notice(&ActivityEvent::RecordPruned {
                path: "/old".to_string()
            })
            .is_none()
        );
    }
}
