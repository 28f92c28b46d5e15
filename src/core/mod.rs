//! Core types: errors, configuration, path helpers, signal handling.

pub mod config;
pub mod errors;
pub mod paths;
pub mod signals;
