//! Shared scan state: liveness clock, cancellation tokens and the atomic
//! counters the reporter polls.
//!
//! One `ScanProgress` is shared (via `Arc`) by the worker, the watchdog and
//! any reporter thread. Counters are plain atomic increments so a reporter
//! reading a snapshot never races a read-modify-write.

#![allow(missing_docs)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

// ──────────────────── liveness ────────────────────

/// Timestamp of the last observed forward I/O progress.
///
/// The hasher beats after every chunk; the watchdog reads the age. Waits on
/// the baseline store (busy timeout, retry backoff, the store mutex) run
/// under [`Liveness::pause`] and never count toward a stall.
#[derive(Debug)]
pub struct Liveness {
    last_beat_ms: AtomicU64,
    paused: AtomicU32,
}

impl Liveness {
    #[must_use]
    pub fn new() -> Self {
        Self {
            last_beat_ms: AtomicU64::new(monotonic_ms()),
            paused: AtomicU32::new(0),
        }
    }

    /// Stop the stall clock until the guard drops. Guards nest; the clock
    /// restarts from a fresh beat when the last one goes.
    pub fn pause(&self) -> PauseGuard<'_> {
        self.paused.fetch_add(1, Ordering::AcqRel);
        PauseGuard { liveness: self }
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire) > 0
    }

    pub fn beat(&self) {
        self.last_beat_ms.store(monotonic_ms(), Ordering::Relaxed);
    }

    /// Time since the last beat.
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        let last = self.last_beat_ms.load(Ordering::Relaxed);
        Duration::from_millis(monotonic_ms().saturating_sub(last))
    }

    #[must_use]
    pub fn is_stalled(&self, timeout: Duration) -> bool {
        !self.is_paused() && self.idle_for() > timeout
    }
}

/// Held while the worker waits on something other than file I/O.
#[derive(Debug)]
#[must_use = "the stall clock resumes as soon as the guard drops"]
pub struct PauseGuard<'a> {
    liveness: &'a Liveness,
}

impl Drop for PauseGuard<'_> {
    fn drop(&mut self) {
        self.liveness.beat();
        self.liveness.paused.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Default for Liveness {
    fn default() -> Self {
        Self::new()
    }
}

/// Milliseconds since a process-local monotonic origin.
///
/// `Instant` rather than `SystemTime`, so clock adjustments never fake a stall.
fn monotonic_ms() -> u64 {
    static ORIGIN: OnceLock<Instant> = OnceLock::new();
    let origin = ORIGIN.get_or_init(Instant::now);
    #[allow(clippy::cast_possible_truncation)]
    let ms = origin.elapsed().as_millis() as u64;
    ms
}

// ──────────────────── cancellation ────────────────────

/// Cooperative cancellation flag, checked at chunk boundaries.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

// ──────────────────── counters ────────────────────

/// Per-file outcome classes counted for the reporter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tally {
    New,
    Updated,
    Matching,
    Alert,
    Skipped,
}

/// Live scan counters.
#[derive(Debug, Default)]
pub struct ScanProgress {
    liveness: Liveness,
    current_file: Mutex<Option<PathBuf>>,
    files_processed: AtomicU64,
    total_files: AtomicU64,
    bytes_processed: AtomicU64,
    total_bytes: AtomicU64,
    new_records: AtomicU64,
    updated_records: AtomicU64,
    matching_records: AtomicU64,
    alerts: AtomicU64,
    skipped: AtomicU64,
}

/// Point-in-time copy of [`ScanProgress`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProgressSnapshot {
    pub current_file: Option<PathBuf>,
    pub files_processed: u64,
    pub total_files: u64,
    pub bytes_processed: u64,
    pub total_bytes: u64,
    pub new_records: u64,
    pub updated_records: u64,
    pub matching_records: u64,
    pub alerts: u64,
    pub skipped: u64,
}

impl ScanProgress {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn liveness(&self) -> &Liveness {
        &self.liveness
    }

    /// Totals from the inventory, set once before processing starts.
    pub fn set_totals(&self, files: u64, bytes: u64) {
        self.total_files.store(files, Ordering::Relaxed);
        self.total_bytes.store(bytes, Ordering::Relaxed);
    }

    /// Running totals while the inventory walk is still in progress.
    pub fn add_discovered(&self, bytes: u64) {
        self.total_files.fetch_add(1, Ordering::Relaxed);
        self.total_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn set_current(&self, path: Option<&Path>) {
        *self.current_file.lock() = path.map(Path::to_path_buf);
    }

    #[must_use]
    pub fn current(&self) -> Option<PathBuf> {
        self.current_file.lock().clone()
    }

    /// Count one finished queue entry of `size` bytes.
    pub fn finish_file(&self, size: u64, tally: Tally) {
        self.files_processed.fetch_add(1, Ordering::Relaxed);
        self.bytes_processed.fetch_add(size, Ordering::Relaxed);
        let counter = match tally {
            Tally::New => &self.new_records,
            Tally::Updated => &self.updated_records,
            Tally::Matching => &self.matching_records,
            Tally::Alert => &self.alerts,
            Tally::Skipped => &self.skipped,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            current_file: self.current(),
            files_processed: self.files_processed.load(Ordering::Relaxed),
            total_files: self.total_files.load(Ordering::Relaxed),
            bytes_processed: self.bytes_processed.load(Ordering::Relaxed),
            total_bytes: self.total_bytes.load(Ordering::Relaxed),
            new_records: self.new_records.load(Ordering::Relaxed),
            updated_records: self.updated_records.load(Ordering::Relaxed),
            matching_records: self.matching_records.load(Ordering::Relaxed),
            alerts: self.alerts.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
        }
    }
}

/// Live pruning counters.
#[derive(Debug, Default)]
pub struct PruneProgress {
    processed: AtomicU64,
    total: AtomicU64,
    pruned: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PruneSnapshot {
    pub processed: u64,
    pub total: u64,
    pub pruned: u64,
}

impl PruneProgress {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_total(&self, total: u64) {
        self.total.store(total, Ordering::Relaxed);
    }

    pub fn record(&self, pruned: bool) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        if pruned {
            self.pruned.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> PruneSnapshot {
        PruneSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            total: self.total.load(Ordering::Relaxed),
            pruned: self.pruned.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn liveness_detects_stall() {
        let live = Liveness::new();
        assert!(!live.is_stalled(Duration::from_secs(60)));
        std::thread::sleep(Duration::from_millis(5));
        assert!(live.is_stalled(Duration::from_millis(1)));
    }

    #[test]
    fn beat_resets_idle_time() {
        let live = Liveness::new();
        std::thread::sleep(Duration::from_millis(20));
        live.beat();
        assert!(live.idle_for() < Duration::from_millis(20));
    }

    #[test]
    fn paused_clock_never_stalls_and_resumes_fresh() {
        let live = Liveness::new();
        {
            let _outer = live.pause();
            let inner = live.pause();
            std::thread::sleep(Duration::from_millis(20));
            assert!(!live.is_stalled(Duration::from_millis(1)));
            drop(inner);
            assert!(live.is_paused());
        }
        assert!(!live.is_paused());
        assert!(live.idle_for() < Duration::from_millis(20));
        std::thread::sleep(Duration::from_millis(5));
        assert!(live.is_stalled(Duration::from_millis(1)));
    }

    #[test]
    fn cancel_token_is_shared_between_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn counters_accumulate_across_threads() {
        let progress = ScanProgress::new();
        progress.set_totals(400, 4_000);
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let progress = Arc::clone(&progress);
                std::thread::spawn(move || {
                    for i in 0..100 {
                        let tally = if i % 2 == 0 { Tally::Matching } else { Tally::New };
                        progress.finish_file(10, tally);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let snap = progress.snapshot();
        assert_eq!(snap.files_processed, 400);
        assert_eq!(snap.bytes_processed, 4_000);
        assert_eq!(snap.matching_records, 200);
        assert_eq!(snap.new_records, 200);
        assert_eq!(snap.total_files, 400);
    }

    #[test]
    fn current_file_round_trips() {
        let progress = ScanProgress::new();
        assert!(progress.current().is_none());
        progress.set_current(Some(Path::new("/data/a.bin")));
        assert_eq!(progress.snapshot().current_file, Some(PathBuf::from("/data/a.bin")));
        progress.set_current(None);
        assert!(progress.current().is_none());
    }

    #[test]
    fn prune_progress_counts() {
        let progress = PruneProgress::new();
        progress.set_total(3);
        progress.record(false);
        progress.record(true);
        assert_eq!(
            progress.snapshot(),
            PruneSnapshot {
                processed: 2,
                total: 3,
                pruned: 1,
            }
        );
    }
}
