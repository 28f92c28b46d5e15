#![forbid(unsafe_code)]

//! Bitrot Sentinel (brs): detects silent data corruption by comparing file
//! contents against a persisted baseline of hashes and modification times.
//!
//! A scan walks a tree, hashes every file and decides per file:
//! 1. **New** files get a baseline record.
//! 2. **Edited** files (mtime moved) are re-baselined silently.
//! 3. **Corrupted** files (content changed, mtime did not) raise an alert.
//!
//! A stall watchdog keeps one wedged read from hanging the run, and the
//! pruner drops records for files that no longer exist.
//!
//! # Library usage
//!
//! ```rust,no_run
//! use bitrot_sentinel::prelude::*;
//! ```

pub mod prelude;

pub mod core;
pub mod logger;
pub mod scanner;
pub mod store;
