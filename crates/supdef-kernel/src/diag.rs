//! Error and warning tallies for a preprocessing run.
//!
//! Counters are plain atomics so any thread — parser, expansion task, or the
//! signal listener — can bump them without taking a lock. The CLI consults
//! `get_errcount` after the run to pick its exit code.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Process-run diagnostics counters.
///
/// Constructed explicitly and injected into the components that report
/// through it; tests build a fresh instance per case.
#[derive(Debug, Default)]
pub struct Diagnostics {
    errors: AtomicUsize,
    warnings: AtomicUsize,
}

impl Diagnostics {
    /// Create a new counter pair, both zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one error. Returns the updated error count.
    pub fn reg_error(&self) -> usize {
        self.errors.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Current error count.
    pub fn get_errcount(&self) -> usize {
        self.errors.load(Ordering::Relaxed)
    }

    /// Record one warning. Returns the updated warning count.
    pub fn reg_warning(&self) -> usize {
        self.warnings.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Current warning count.
    pub fn get_warncount(&self) -> usize {
        self.warnings.load(Ordering::Relaxed)
    }
}
