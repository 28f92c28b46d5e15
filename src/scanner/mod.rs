//! Verification pipeline: inventory walk, streaming hasher, decision engine,
//! stall watchdog and the baseline pruner.

pub mod engine;
pub mod hasher;
pub mod inventory;
pub mod progress;
pub mod prune;
pub mod watchdog;
