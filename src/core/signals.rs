//! SIGINT/SIGTERM handling for long scans.
//!
//! Uses the `signal-hook` crate for safe signal registration. The scan
//! supervisor polls the flag on every watchdog tick rather than blocking on
//! signals.

#![allow(missing_docs)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Interrupt flag shared between the OS signal hook and the scan loop.
#[derive(Clone, Default)]
pub struct SignalHandler {
    interrupt_flag: Arc<AtomicBool>,
}

impl SignalHandler {
    /// Create a handler without touching process signal state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a handler and hook SIGINT and SIGTERM into it.
    ///
    /// Registration is best-effort; failures go to stderr but are not fatal.
    #[cfg(feature = "signals")]
    pub fn install() -> Self {
        use signal_hook::consts::{SIGINT, SIGTERM};

        let handler = Self::new();
        for (name, signal) in [("SIGINT", SIGINT), ("SIGTERM", SIGTERM)] {
            if let Err(e) = signal_hook::flag::register(signal, Arc::clone(&handler.interrupt_flag))
            {
                eprintln!("[BRS-SIGNAL] failed to register {name}: {e}");
            }
        }
        handler
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupt_flag.load(Ordering::Relaxed)
    }

    /// Programmatically request an interrupt.
    pub fn request_interrupt(&self) {
        self.interrupt_flag.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_handler_is_not_interrupted() {
        assert!(!SignalHandler::new().is_interrupted());
    }

    #[test]
    fn request_is_visible_through_clones() {
        let handler = SignalHandler::new();
        let observer = handler.clone();
        handler.request_interrupt();
        assert!(observer.is_interrupted());
    }
}
