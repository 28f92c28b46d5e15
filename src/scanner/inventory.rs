//! Parallel inventory collector: walks the tree once and builds the work list.
//!
//! Directories are traversed by a worker pool fed through a crossbeam channel;
//! files come back on a result channel and are merged on the calling thread.
//! Directory symlinks below the root are never followed, so once the root is
//! canonical every regular file path below it is canonical too, and only file
//! symlinks need a `realpath` call. The root itself is always followed: a
//! root that is a symlink to a directory is walked under the name it was
//! given.
//!
//! In canonical mode entries collapse by `(device, inode)`: symlinks and hard
//! links to one file become a single entry. In verbatim mode nothing is
//! merged and symlinks are ignored.

#![allow(missing_docs)]

use std::collections::{HashMap, HashSet};
use std::fs::{self, FileType};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam_channel as channel;

use crate::core::errors::{BrsError, Result};
use crate::core::paths::record_key;
use crate::scanner::progress::ScanProgress;

/// Collector configuration derived from `ScanConfig`.
#[derive(Debug, Clone)]
pub struct InventoryConfig {
    pub root: PathBuf,
    /// Resolve paths with `realpath` and merge aliases of one file.
    pub canonicalize: bool,
    pub parallelism: usize,
    pub cross_devices: bool,
    pub excluded_paths: HashSet<PathBuf>,
}

/// One file to verify.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InventoryEntry {
    pub path: PathBuf,
    pub size_bytes: u64,
}

/// The work list plus the totals reported before processing starts.
#[derive(Debug, Clone, Default)]
pub struct Inventory {
    /// Sorted by path.
    pub entries: Vec<InventoryEntry>,
    pub total_files: u64,
    pub total_bytes: u64,
    /// Entries dropped because their path has no text form.
    pub skipped: u64,
    /// The dropped paths themselves, for the caller to report.
    pub unrepresentable: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum DedupKey {
    Inode(u64, u64),
    Path(PathBuf),
}

#[derive(Debug)]
struct Discovered {
    path: PathBuf,
    size_bytes: u64,
    file_id: Option<(u64, u64)>,
}

/// What a walker sends back for one non-directory entry.
#[derive(Debug)]
enum Walked {
    File(Discovered),
    /// A regular file whose path has no UTF-8 form and cannot be a record key.
    Unrepresentable(PathBuf),
}

/// Item in the internal work queue: (directory_path, root_device_id).
type WorkItem = (PathBuf, u64);

/// Walks one root and returns the deduplicated work list.
pub struct InventoryCollector {
    config: InventoryConfig,
}

impl InventoryCollector {
    pub fn new(config: InventoryConfig) -> Self {
        Self { config }
    }

    /// Walk the tree. Discovered totals are pushed into `progress` as the walk
    /// runs, then replaced by the deduplicated totals.
    pub fn collect(&self, progress: Option<&ScanProgress>) -> Result<Inventory> {
        let root = if self.config.canonicalize {
            fs::canonicalize(&self.config.root)
                .map_err(|source| BrsError::io(&self.config.root, source))?
        } else {
            self.config.root.clone()
        };
        let root_meta = fs::metadata(&root).map_err(|source| BrsError::io(&root, source))?;

        let (result_tx, result_rx) = channel::unbounded::<Walked>();

        let mut workers = Vec::new();
        if root_meta.is_dir() {
            // Unbounded: a full queue must never cost us a subtree.
            let (work_tx, work_rx) = channel::unbounded::<WorkItem>();
            let in_flight = Arc::new(AtomicUsize::new(1));
            let _ = work_tx.send((root, device_id(&root_meta)));

            for index in 0..self.config.parallelism.max(1) {
                let work_rx = work_rx.clone();
                let work_tx = work_tx.clone();
                let result_tx = result_tx.clone();
                let in_flight = Arc::clone(&in_flight);
                let config = self.config.clone();

                let handle = thread::Builder::new()
                    .name(format!("brs-walker-{index}"))
                    .spawn(move || {
                        walker_thread(&work_rx, &work_tx, &result_tx, &in_flight, &config);
                    })
                    .map_err(|e| BrsError::Runtime {
                        details: format!("failed to spawn walker thread: {e}"),
                    })?;
                workers.push(handle);
            }
        } else if let Some(walked) = inspect_file(root.clone(), root_meta.file_type(), &self.config)
        {
            let _ = result_tx.send(walked);
        }
        // Close our sender so the result stream ends when the workers exit.
        drop(result_tx);

        let mut merged: HashMap<DedupKey, Discovered> = HashMap::new();
        let mut verbatim: Vec<Discovered> = Vec::new();
        let mut unrepresentable: Vec<PathBuf> = Vec::new();
        for walked in &result_rx {
            let found = match walked {
                Walked::File(found) => found,
                Walked::Unrepresentable(path) => {
                    unrepresentable.push(path);
                    continue;
                }
            };
            if let Some(progress) = progress {
                progress.add_discovered(found.size_bytes);
            }
            if self.config.canonicalize {
                let key = found
                    .file_id
                    .map_or_else(|| DedupKey::Path(found.path.clone()), |(dev, ino)| {
                        DedupKey::Inode(dev, ino)
                    });
                match merged.get_mut(&key) {
                    // Keep the smallest path so the choice is stable across runs.
                    Some(existing) if found.path < existing.path => *existing = found,
                    Some(_) => {}
                    None => {
                        merged.insert(key, found);
                    }
                }
            } else {
                verbatim.push(found);
            }
        }
        for handle in workers {
            let _ = handle.join();
        }

        let mut entries: Vec<InventoryEntry> = merged
            .into_values()
            .chain(verbatim)
            .map(|found| InventoryEntry {
                path: found.path,
                size_bytes: found.size_bytes,
            })
            .collect();
        entries.sort_by(|a, b| a.path.cmp(&b.path));

        let total_files = entries.len() as u64;
        let total_bytes = entries.iter().map(|e| e.size_bytes).sum();
        if let Some(progress) = progress {
            progress.set_totals(total_files, total_bytes);
        }

        unrepresentable.sort();
        Ok(Inventory {
            entries,
            total_files,
            total_bytes,
            skipped: unrepresentable.len() as u64,
            unrepresentable,
        })
    }
}

/// Worker thread function: pulls directories from the work channel, emits
/// files, and queues subdirectories.
fn walker_thread(
    work_rx: &channel::Receiver<WorkItem>,
    work_tx: &channel::Sender<WorkItem>,
    result_tx: &channel::Sender<Walked>,
    in_flight: &AtomicUsize,
    config: &InventoryConfig,
) {
    loop {
        match work_rx.recv_timeout(Duration::from_millis(50)) {
            Ok((dir_path, root_dev)) => {
                process_directory(&dir_path, root_dev, work_tx, result_tx, in_flight, config);
                in_flight.fetch_sub(1, Ordering::AcqRel);
            }
            Err(channel::RecvTimeoutError::Timeout) => {
                if in_flight.load(Ordering::Acquire) == 0 {
                    return;
                }
            }
            Err(channel::RecvTimeoutError::Disconnected) => return,
        }
    }
}

fn process_directory(
    dir_path: &Path,
    root_dev: u64,
    work_tx: &channel::Sender<WorkItem>,
    result_tx: &channel::Sender<Walked>,
    in_flight: &AtomicUsize,
    config: &InventoryConfig,
) {
    if config.excluded_paths.contains(dir_path) {
        return;
    }

    // Mount points queued by the parent are rejected here, once per directory.
    if !config.cross_devices {
        match fs::metadata(dir_path) {
            Ok(meta) if device_id(&meta) == root_dev => {}
            _ => return,
        }
    }

    // Unreadable directories are skipped, never fatal.
    let Ok(entries) = fs::read_dir(dir_path) else {
        return;
    };

    let mut pending_children: Vec<PathBuf> = Vec::new();
    for entry in entries.flatten() {
        let Ok(ft) = entry.file_type() else {
            continue;
        };
        let child_path = entry.path();

        if ft.is_dir() {
            if !config.excluded_paths.contains(&child_path) {
                pending_children.push(child_path);
            }
            continue;
        }

        if let Some(walked) = inspect_file(child_path, ft, config) {
            let _ = result_tx.send(walked);
        }
    }

    for child_path in pending_children {
        in_flight.fetch_add(1, Ordering::Release);
        if work_tx.send((child_path, root_dev)).is_err() {
            in_flight.fetch_sub(1, Ordering::Release);
        }
    }
}

/// Turn a non-directory entry into a work item, or `None` to skip it.
///
/// Broken or unreadable symlinks and non-regular targets are skipped silently.
fn inspect_file(path: PathBuf, ft: FileType, config: &InventoryConfig) -> Option<Walked> {
    let (path, meta) = if ft.is_file() {
        let meta = fs::metadata(&path).ok()?;
        (path, meta)
    } else if ft.is_symlink() && config.canonicalize {
        let target = fs::canonicalize(&path).ok()?;
        let meta = fs::metadata(&target).ok()?;
        if !meta.is_file() {
            return None;
        }
        (target, meta)
    } else {
        return None;
    };

    if record_key(&path).is_none() {
        return Some(Walked::Unrepresentable(path));
    }

    Some(Walked::File(Discovered {
        size_bytes: meta.len(),
        file_id: file_id(&meta),
        path,
    }))
}

/// Get device ID from metadata (for cross-device detection).
fn device_id(meta: &fs::Metadata) -> u64 {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        meta.dev()
    }
    #[cfg(not(unix))]
    {
        let _ = meta;
        0
    }
}

/// `(device, inode)` identity of a file, where the platform has one.
fn file_id(meta: &fs::Metadata) -> Option<(u64, u64)> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        Some((meta.dev(), meta.ino()))
    }
    #[cfg(not(unix))]
    {
        let _ = meta;
        None
    }
}
