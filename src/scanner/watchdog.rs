//! Stall watchdog: runs the verification worker as a cancellable thread and
//! restarts it when reads stop making progress.
//!
//! The supervisor owns the queue. Each worker generation pops entries from
//! the front and records the one it is working on. When the liveness clock
//! has been idle for longer than the stall timeout, the supervisor cancels
//! the generation, requeues the in-flight file at the front (or drops it when
//! it is the same file that stalled on the previous attempt) and launches a
//! fresh generation. A cancelled worker is detached: a read blocked in the
//! kernel cannot be interrupted, but its cancel token guarantees that nothing
//! it finishes afterwards is written.
//!
//! Time the worker spends waiting on the baseline store is excluded from the
//! stall clock (see [`crate::scanner::progress::Liveness::pause`]).
//!
//! A worker that panics is handled like a stalled one: its file is retried
//! once and then skipped. Detecting the panic needs unwinding, so this only
//! applies to builds with `panic = "unwind"` (debug and test profiles). The
//! release profile aborts the process on panic instead.

#![allow(missing_docs)]

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use parking_lot::Mutex;

use crate::core::config::WatchdogConfig;
use crate::core::errors::{BrsError, Result};
use crate::core::signals::SignalHandler;
use crate::logger::activity::ActivityEvent;
use crate::scanner::engine::VerificationEngine;
use crate::scanner::inventory::InventoryEntry;
use crate::scanner::progress::{CancelToken, Tally};

/// Supervisor timing.
#[derive(Debug, Clone, Copy)]
pub struct WatchdogSettings {
    pub stall_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for WatchdogSettings {
    fn default() -> Self {
        Self {
            stall_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_secs(1),
        }
    }
}

impl From<&WatchdogConfig> for WatchdogSettings {
    fn from(config: &WatchdogConfig) -> Self {
        Self {
            stall_timeout: config.stall_timeout(),
            poll_interval: config.poll_interval(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    Running,
    Stalled,
    Done,
}

/// What the supervisor had to do during one drain.
#[derive(Debug, Clone, Default)]
pub struct WatchdogSummary {
    pub retried: Vec<PathBuf>,
    pub skipped: Vec<PathBuf>,
    pub interrupted: bool,
    pub generations: u32,
}

// ──────────────────── shared queue ────────────────────

#[derive(Default)]
struct QueueState {
    pending: VecDeque<InventoryEntry>,
    /// Entry being processed, tagged with the generation that popped it.
    in_flight: Option<(u32, InventoryEntry)>,
}

type SharedQueue = Arc<Mutex<QueueState>>;

/// Sent by every worker when it exits, including by unwinding. Under
/// `panic = "abort"` no exit is ever reported for a panic.
#[derive(Debug, Clone, Copy)]
struct WorkerExit {
    generation: u32,
    panicked: bool,
}

struct ExitGuard {
    generation: u32,
    tx: Sender<WorkerExit>,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        let _ = self.tx.send(WorkerExit {
            generation: self.generation,
            panicked: thread::panicking(),
        });
    }
}

struct Generation {
    id: u32,
    cancel: CancelToken,
    handle: Option<thread::JoinHandle<()>>,
}

// ──────────────────── supervisor ────────────────────

pub struct Watchdog {
    settings: WatchdogSettings,
}

impl Watchdog {
    #[must_use]
    pub fn new(settings: WatchdogSettings) -> Self {
        Self { settings }
    }

    /// Drain `entries` through `engine`, restarting stalled workers, until the
    /// queue is empty or an interrupt is requested.
    pub fn supervise(
        &self,
        engine: &Arc<VerificationEngine>,
        entries: Vec<InventoryEntry>,
        signals: &SignalHandler,
    ) -> Result<WatchdogSummary> {
        let queue: SharedQueue = Arc::new(Mutex::new(QueueState {
            pending: entries.into(),
            in_flight: None,
        }));
        let (exit_tx, exit_rx) = unbounded::<WorkerExit>();
        let mut summary = WatchdogSummary::default();
        let mut last_retried: Option<PathBuf> = None;

        let mut current = launch(engine, &queue, &exit_tx, 0)?;
        summary.generations = 1;
        let mut state = WatchState::Running;

        while state != WatchState::Done {
            match exit_rx.recv_timeout(self.settings.poll_interval) {
                Ok(exit) if exit.generation == current.id && !exit.panicked => {
                    if let Some(handle) = current.handle.take() {
                        let _ = handle.join();
                    }
                    state = WatchState::Done;
                    continue;
                }
                Ok(exit) if exit.generation == current.id => {
                    engine.logger().send(ActivityEvent::Error {
                        code: "BRS-3900".to_string(),
                        message: "verification worker panicked".to_string(),
                    });
                    state = WatchState::Stalled;
                }
                // Exits of detached generations are only bookkeeping.
                Ok(_) | Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(BrsError::ChannelClosed {
                        component: "watchdog",
                    });
                }
            }

            if signals.is_interrupted() {
                current.cancel.cancel();
                summary.interrupted = true;
                self.await_exit(&exit_rx, current.id);
                break;
            }

            let liveness = engine.progress().liveness();
            let idle = liveness.idle_for();
            let idle_too_long = liveness.is_stalled(self.settings.stall_timeout);
            if state == WatchState::Running && idle_too_long {
                state = WatchState::Stalled;
            }
            if state != WatchState::Stalled {
                continue;
            }

            current.cancel.cancel();
            let stalled = take_in_flight(&queue, current.id);
            if let Some(entry) = stalled {
                #[allow(clippy::cast_possible_truncation)]
                let idle_ms = idle.as_millis() as u64;
                let path_text = entry.path.display().to_string();
                if last_retried.as_ref() == Some(&entry.path) {
                    engine.logger().send(ActivityEvent::StallSkip {
                        path: path_text,
                        idle_ms,
                    });
                    engine
                        .progress()
                        .finish_file(entry.size_bytes, Tally::Skipped);
                    summary.skipped.push(entry.path);
                    last_retried = None;
                } else {
                    engine.logger().send(ActivityEvent::StallRetry {
                        path: path_text,
                        idle_ms,
                    });
                    summary.retried.push(entry.path.clone());
                    last_retried = Some(entry.path.clone());
                    queue.lock().pending.push_front(entry);
                }
            }

            // The old thread is left to unwind on its own.
            drop(current.handle.take());
            current = launch(engine, &queue, &exit_tx, current.id + 1)?;
            summary.generations += 1;
            state = WatchState::Running;
        }

        Ok(summary)
    }

    /// Give an interrupted worker one stall period to notice its token.
    fn await_exit(&self, exit_rx: &Receiver<WorkerExit>, generation: u32) {
        let deadline = Instant::now() + self.settings.stall_timeout;
        while let Some(left) = deadline.checked_duration_since(Instant::now()) {
            match exit_rx.recv_timeout(left) {
                Ok(exit) if exit.generation == generation => return,
                Ok(_) => {}
                Err(_) => return,
            }
        }
    }
}

fn take_in_flight(queue: &SharedQueue, generation: u32) -> Option<InventoryEntry> {
    let mut state = queue.lock();
    match state.in_flight.take() {
        Some((owner, entry)) if owner == generation => Some(entry),
        other => {
            state.in_flight = other;
            None
        }
    }
}

fn launch(
    engine: &Arc<VerificationEngine>,
    queue: &SharedQueue,
    exit_tx: &Sender<WorkerExit>,
    id: u32,
) -> Result<Generation> {
    let cancel = CancelToken::new();
    // A fresh generation starts with a full stall budget.
    engine.progress().liveness().beat();

    let engine = Arc::clone(engine);
    let queue = Arc::clone(queue);
    let worker_cancel = cancel.clone();
    let guard = ExitGuard {
        generation: id,
        tx: exit_tx.clone(),
    };
    let handle = thread::Builder::new()
        .name(format!("brs-verify-{id}"))
        .spawn(move || {
            let _guard = guard;
            worker_main(&engine, &queue, &worker_cancel, id);
        })
        .map_err(|e| BrsError::Runtime {
            details: format!("failed to spawn verification worker: {e}"),
        })?;

    Ok(Generation {
        id,
        cancel,
        handle: Some(handle),
    })
}

fn worker_main(
    engine: &VerificationEngine,
    queue: &SharedQueue,
    cancel: &CancelToken,
    generation: u32,
) {
    let progress = engine.progress();
    loop {
        let entry = {
            let mut state = queue.lock();
            // Checked under the lock the supervisor takes after cancelling, so
            // a cancelled worker never claims another entry.
            if cancel.is_cancelled() {
                return;
            }
            let Some(entry) = state.pending.pop_front() else {
                return;
            };
            state.in_flight = Some((generation, entry.clone()));
            entry
        };

        progress.liveness().beat();
        progress.set_current(Some(&entry.path));
        engine.process_entry(&entry, cancel);

        let mut state = queue.lock();
        if matches!(&state.in_flight, Some((owner, _)) if *owner == generation) {
            state.in_flight = None;
        }
    }
}
