//! Cooperative interruption of a run.
//!
//! A signal handler stores the signal number; the runner notices it between
//! stages and while a build is streaming, forwards it to the build and lets
//! cleanup run as usual.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct Interrupt(Arc<AtomicUsize>);

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    /// The cell a signal handler writes the signal number into.
    pub fn flag(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.0)
    }

    pub fn raise(&self, signal: i32) {
        self.0.store(signal.max(0) as usize, Ordering::SeqCst);
    }

    /// The last signal raised, if any.
    pub fn signal(&self) -> Option<i32> {
        match self.0.load(Ordering::SeqCst) {
            0 => None,
            signal => Some(signal as i32),
        }
    }
}
