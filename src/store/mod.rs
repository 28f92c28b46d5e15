//! Baseline persistence: the SQLite store of per-file hashes and the
//! iteration counter.

pub mod baseline;

use std::sync::Arc;

use parking_lot::Mutex;

pub use baseline::{BaselineStore, FileRecord, NewRecord, RecordUpdate, RetryPolicy};

/// The single connection, serialized for the watchdog and worker threads.
pub type SharedStore = Arc<Mutex<BaselineStore>>;

/// Wrap a store for shared use.
pub fn shared(store: BaselineStore) -> SharedStore {
    Arc::new(Mutex::new(store))
}
