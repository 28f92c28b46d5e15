//! End-to-end verification scenarios driven through the library API:
//! first baseline, steady state, silent corruption, legitimate edits,
//! aliases, stall recovery, a baseline locked by another process.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bitrot_sentinel::core::errors::{BrsError, Result};
use bitrot_sentinel::core::signals::SignalHandler;
use bitrot_sentinel::logger::activity::{ActivityEvent, ActivityLoggerHandle};
use bitrot_sentinel::scanner::engine::{ScanContext, ScanReport, ScanSettings, run_scan};
use bitrot_sentinel::scanner::hasher::{ContentHasher, Sha256Hasher};
use bitrot_sentinel::scanner::inventory::InventoryConfig;
use bitrot_sentinel::scanner::progress::{CancelToken, Liveness, ScanProgress};
use bitrot_sentinel::scanner::watchdog::WatchdogSettings;
use bitrot_sentinel::store::{
    BaselineStore, FileRecord, NewRecord, RetryPolicy, SharedStore, shared,
};
use filetime::FileTime;
use parking_lot::Mutex;
use tempfile::TempDir;

fn scan_with(
    store: &SharedStore,
    root: &Path,
    canonicalize: bool,
    hasher: Arc<dyn ContentHasher>,
    watchdog: WatchdogSettings,
) -> ScanReport {
    let ctx = ScanContext {
        store: Arc::clone(store),
        hasher,
        logger: ActivityLoggerHandle::disconnected(),
        progress: ScanProgress::new(),
        signals: SignalHandler::new(),
    };
    let settings = ScanSettings {
        inventory: InventoryConfig {
            root: root.to_path_buf(),
            canonicalize,
            parallelism: 2,
            cross_devices: false,
            excluded_paths: HashSet::new(),
        },
        watchdog,
        config_hash: None,
    };
    run_scan(&ctx, &settings).expect("scan completes")
}

fn scan(store: &SharedStore, root: &Path) -> ScanReport {
    scan_with(
        store,
        root,
        true,
        Arc::new(Sha256Hasher::new(16)),
        WatchdogSettings::default(),
    )
}

fn record(store: &SharedStore, path: &Path) -> Option<FileRecord> {
    store
        .lock()
        .find_by_path(path.to_str().expect("utf-8 path"))
        .expect("lookup")
}

/// Rewrite `path` with `content` while keeping its mtime bit-for-bit.
fn corrupt_in_place(path: &Path, content: &[u8]) {
    let before = FileTime::from_last_modification_time(&fs::metadata(path).unwrap());
    fs::write(path, content).unwrap();
    filetime::set_file_mtime(path, before).unwrap();
}

fn canonical_tree() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = fs::canonicalize(tmp.path()).unwrap();
    (tmp, root)
}

#[test]
fn first_scan_inserts_one_record_per_file() {
    let (_tmp, root) = canonical_tree();
    fs::create_dir_all(root.join("a/b")).unwrap();
    fs::write(root.join("top.txt"), b"top").unwrap();
    fs::write(root.join("a/mid.txt"), b"mid").unwrap();
    fs::write(root.join("a/b/leaf.bin"), b"").unwrap();

    let store = shared(BaselineStore::open_in_memory().unwrap());
    let report = scan(&store, &root);

    assert_eq!(report.iteration, 1);
    assert_eq!(report.new_records, 3);
    assert_eq!(report.files_processed, 3);
    assert!(!report.has_alerts());
    assert_eq!(store.lock().count().unwrap(), 3);

    let leaf = record(&store, &root.join("a/b/leaf.bin")).unwrap();
    // SHA-256 of the empty input.
    assert_eq!(
        leaf.content_hash,
        "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
    );
    assert_eq!(leaf.iteration, 1);
}

#[test]
fn steady_state_scans_do_not_touch_content_or_alert() {
    let (_tmp, root) = canonical_tree();
    let file = root.join("stable.txt");
    fs::write(&file, b"unchanging").unwrap();

    let store = shared(BaselineStore::open_in_memory().unwrap());
    scan(&store, &root);
    let first = record(&store, &file).unwrap();

    for expected_iteration in 2..=4 {
        let report = scan(&store, &root);
        assert_eq!(report.iteration, expected_iteration);
        assert_eq!(report.matching_records, 1);
        assert!(!report.has_alerts());
        let current = record(&store, &file).unwrap();
        assert_eq!(current.content_hash, first.content_hash);
        assert_eq!(current.mtime, first.mtime);
        assert_eq!(current.id, first.id);
    }
}

#[test]
fn content_change_with_held_mtime_raises_one_alert_and_keeps_baseline() {
    let (_tmp, root) = canonical_tree();
    let file = root.join("f.txt");
    fs::write(&file, b"H1 content").unwrap();

    let store = shared(BaselineStore::open_in_memory().unwrap());
    scan(&store, &root);
    let baseline = record(&store, &file).unwrap();

    corrupt_in_place(&file, b"H2 content");
    let report = scan(&store, &root);

    assert_eq!(report.alerts.len(), 1);
    let alert = &report.alerts[0];
    assert_eq!(alert.path, file.to_str().unwrap());
    assert_eq!(alert.expected_hash, baseline.content_hash);
    assert_ne!(alert.actual_hash, baseline.content_hash);
    assert_eq!(alert.mtime, baseline.mtime);
    assert_eq!(alert.iteration, 2);

    let after = record(&store, &file).unwrap();
    assert_eq!(after.content_hash, baseline.content_hash);
    assert_eq!(after.iteration, baseline.iteration);

    // No self-healing: the next pass alerts again.
    let again = scan(&store, &root);
    assert_eq!(again.alerts.len(), 1);
}

#[test]
fn seeded_baseline_at_older_iteration_alerts_on_new_hash() {
    let (_tmp, root) = canonical_tree();
    let file = root.join("f.txt");
    fs::write(&file, b"now hashes to H2").unwrap();
    let modified = fs::metadata(&file).unwrap().modified().unwrap();
    let mtime = chrono::DateTime::<chrono::Utc>::from(modified);

    let store = shared(BaselineStore::open_in_memory().unwrap());
    {
        let guard = store.lock();
        guard.set_iteration(3).unwrap();
        guard
            .insert(&NewRecord {
                path: file.to_str().unwrap(),
                content_hash: "H1",
                mtime,
                iteration: 3,
            })
            .unwrap();
    }

    let report = scan(&store, &root);
    assert_eq!(report.iteration, 4);
    assert_eq!(report.alerts.len(), 1);
    assert_eq!(report.alerts[0].expected_hash, "H1");
    assert_eq!(record(&store, &file).unwrap().content_hash, "H1");
}

#[test]
fn mtime_change_updates_record_without_alert() {
    let (_tmp, root) = canonical_tree();
    let touched = root.join("touched.txt");
    let edited = root.join("edited.txt");
    fs::write(&touched, b"same bytes").unwrap();
    fs::write(&edited, b"old bytes").unwrap();

    let store = shared(BaselineStore::open_in_memory().unwrap());
    scan(&store, &root);
    let touched_before = record(&store, &touched).unwrap();
    let edited_before = record(&store, &edited).unwrap();

    let later = FileTime::from_unix_time(2_000_000_000, 123_456_789);
    filetime::set_file_mtime(&touched, later).unwrap();
    fs::write(&edited, b"new bytes, new mtime").unwrap();
    filetime::set_file_mtime(&edited, later).unwrap();

    let report = scan(&store, &root);
    assert!(!report.has_alerts());
    assert_eq!(report.updated_records, 2);

    let touched_after = record(&store, &touched).unwrap();
    assert_eq!(touched_after.content_hash, touched_before.content_hash);
    assert_ne!(touched_after.mtime, touched_before.mtime);
    assert_eq!(touched_after.mtime.timestamp_subsec_nanos(), 123_456_789);
    assert_eq!(touched_after.iteration, 2);

    let edited_after = record(&store, &edited).unwrap();
    assert_ne!(edited_after.content_hash, edited_before.content_hash);
    assert_eq!(edited_after.iteration, 2);
}

#[cfg(unix)]
#[test]
fn aliases_of_one_file_are_processed_once() {
    let (_tmp, root) = canonical_tree();
    let real = root.join("real.txt");
    fs::write(&real, b"shared").unwrap();
    std::os::unix::fs::symlink(&real, root.join("alias.txt")).unwrap();
    fs::hard_link(&real, root.join("zz-hardlink.txt")).unwrap();

    let store = shared(BaselineStore::open_in_memory().unwrap());
    let report = scan(&store, &root);

    assert_eq!(report.files_processed, 1);
    assert_eq!(store.lock().count().unwrap(), 1);
    assert!(record(&store, &real).is_some());
}

#[cfg(unix)]
#[test]
fn verbatim_mode_keeps_walked_paths() {
    let (_tmp, root) = canonical_tree();
    let real = root.join("real.txt");
    fs::write(&real, b"shared").unwrap();
    std::os::unix::fs::symlink(&real, root.join("alias.txt")).unwrap();

    let store = shared(BaselineStore::open_in_memory().unwrap());
    let report = scan_with(
        &store,
        &root,
        false,
        Arc::new(Sha256Hasher::new(16)),
        WatchdogSettings::default(),
    );

    // Symlinks are not followed without canonicalization.
    assert_eq!(report.files_processed, 1);
    assert!(record(&store, &root.join("alias.txt")).is_none());
}

/// Hashes normally except for files named `stuck*`, which go silent
/// until the watchdog cancels them.
struct SilentOnStuck {
    inner: Sha256Hasher,
    attempts: Mutex<HashMap<PathBuf, u32>>,
}

impl ContentHasher for SilentOnStuck {
    fn hash(&self, path: &Path, liveness: &Liveness, cancel: &CancelToken) -> Result<String> {
        *self.attempts.lock().entry(path.to_path_buf()).or_insert(0) += 1;
        let stuck = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with("stuck"));
        if stuck {
            while !cancel.is_cancelled() {
                thread::sleep(Duration::from_millis(5));
            }
            return Err(BrsError::Cancelled {
                path: path.to_path_buf(),
            });
        }
        self.inner.hash(path, liveness, cancel)
    }
}

#[test]
fn stalled_file_is_retried_once_then_skipped() {
    let (_tmp, root) = canonical_tree();
    for name in ["a.txt", "stuck.dat", "z.txt"] {
        fs::write(root.join(name), name.as_bytes()).unwrap();
    }
    let hasher = Arc::new(SilentOnStuck {
        inner: Sha256Hasher::new(16),
        attempts: Mutex::new(HashMap::new()),
    });

    let store = shared(BaselineStore::open_in_memory().unwrap());
    let report = scan_with(
        &store,
        &root,
        true,
        hasher.clone(),
        WatchdogSettings {
            stall_timeout: Duration::from_millis(150),
            poll_interval: Duration::from_millis(20),
        },
    );

    let stuck = root.join("stuck.dat");
    assert_eq!(hasher.attempts.lock().get(&stuck).copied(), Some(2));
    assert_eq!(report.retried, vec![stuck.clone()]);
    assert_eq!(report.stall_skipped, vec![stuck.clone()]);
    assert!(!report.interrupted);
    assert_eq!(report.new_records, 2);
    assert!(record(&store, &stuck).is_none());
    assert!(record(&store, &root.join("z.txt")).is_some());
}

#[test]
fn baseline_survives_reopen_from_disk() {
    let (_tmp, root) = canonical_tree();
    let data = root.join("data");
    fs::create_dir(&data).unwrap();
    fs::write(data.join("x.txt"), b"x").unwrap();
    let db = root.join("baseline.db");

    let open = || {
        shared(
            BaselineStore::open(
                &db,
                RetryPolicy {
                    attempts: 3,
                    backoff: Duration::from_millis(10),
                },
                Duration::from_secs(1),
            )
            .unwrap(),
        )
    };

    let first = scan(&open(), &data);
    assert_eq!(first.new_records, 1);

    let second = scan(&open(), &data);
    assert_eq!(second.iteration, 2);
    assert_eq!(second.matching_records, 1);
    assert_eq!(second.new_records, 0);
}

/// On its first call, has a second connection take the write lock on `db`
/// with `BEGIN EXCLUSIVE` and keep it for `hold`.
struct LockedByNeighbour {
    inner: Sha256Hasher,
    db: PathBuf,
    hold: Duration,
    holder: Mutex<Option<thread::JoinHandle<()>>>,
}

impl ContentHasher for LockedByNeighbour {
    fn hash(&self, path: &Path, liveness: &Liveness, cancel: &CancelToken) -> Result<String> {
        let mut holder = self.holder.lock();
        if holder.is_none() {
            let (locked_tx, locked_rx) = crossbeam_channel::bounded(1);
            let db = self.db.clone();
            let hold = self.hold;
            *holder = Some(thread::spawn(move || {
                let conn = rusqlite::Connection::open(&db).unwrap();
                conn.execute_batch("BEGIN EXCLUSIVE").unwrap();
                locked_tx.send(()).unwrap();
                thread::sleep(hold);
                conn.execute_batch("COMMIT").unwrap();
            }));
            locked_rx.recv().unwrap();
        }
        drop(holder);
        self.inner.hash(path, liveness, cancel)
    }
}

#[test]
fn baseline_locked_by_another_connection_is_waited_out_not_stalled() {
    let (_tmp, root) = canonical_tree();
    let data = root.join("data");
    fs::create_dir(&data).unwrap();
    for i in 0..5 {
        fs::write(data.join(format!("f{i}.txt")), format!("file {i}")).unwrap();
    }
    let db = root.join("state").join("baseline.db");
    let (logger, events) = ActivityLoggerHandle::in_memory(256);
    let store = shared(
        BaselineStore::open_logged(
            &db,
            RetryPolicy {
                attempts: 8,
                backoff: Duration::from_millis(50),
            },
            Duration::from_millis(300),
            logger.clone(),
        )
        .unwrap(),
    );
    let hasher = Arc::new(LockedByNeighbour {
        inner: Sha256Hasher::new(16),
        db: db.clone(),
        hold: Duration::from_millis(1_500),
        holder: Mutex::new(None),
    });

    let ctx = ScanContext {
        store: Arc::clone(&store),
        hasher: hasher.clone(),
        logger,
        progress: ScanProgress::new(),
        signals: SignalHandler::new(),
    };
    let settings = ScanSettings {
        inventory: InventoryConfig {
            root: data.clone(),
            canonicalize: true,
            parallelism: 2,
            cross_devices: false,
            excluded_paths: HashSet::new(),
        },
        // The lock is held for five stall periods.
        watchdog: WatchdogSettings {
            stall_timeout: Duration::from_millis(300),
            poll_interval: Duration::from_millis(20),
        },
        config_hash: None,
    };
    let report = run_scan(&ctx, &settings).expect("scan completes");
    if let Some(holder) = hasher.holder.lock().take() {
        holder.join().unwrap();
    }

    assert!(report.retried.is_empty(), "retried: {:?}", report.retried);
    assert!(report.stall_skipped.is_empty());
    assert_eq!(report.new_records, 5);
    assert_eq!(store.lock().count().unwrap(), 5);
    let store_retries = events
        .try_iter()
        .filter(|event| matches!(event, ActivityEvent::StoreRetry { .. }))
        .count();
    assert!(store_retries > 0);
}
