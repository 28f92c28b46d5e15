//! Convenience re-exports for library consumers.
//!
//! ```rust,no_run
//! use bitrot_sentinel::prelude::*;
//! ```

// Core
pub use crate::core::config::Config;
pub use crate::core::errors::{BrsError, Result};
pub use crate::core::signals::SignalHandler;

// Store
pub use crate::store::{BaselineStore, FileRecord, RetryPolicy, SharedStore};

// Scanner
pub use crate::scanner::engine::{
    CorruptionAlert, ScanContext, ScanReport, ScanSettings, VerificationEngine, accept_baseline,
    run_scan,
};
pub use crate::scanner::hasher::{ContentHasher, Sha256Hasher};
pub use crate::scanner::inventory::{InventoryCollector, InventoryConfig, InventoryEntry};
pub use crate::scanner::progress::{PruneProgress, ScanProgress};
pub use crate::scanner::prune::{PathPattern, PruneReport, Pruner};
pub use crate::scanner::watchdog::{Watchdog, WatchdogSettings};

// Logger
pub use crate::logger::activity::{ActivityEvent, ActivityLoggerHandle, spawn_logger};
