//! Thread-safe stop request for a running loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::event::CounterHandle;

/// Stops the loop from any thread.
///
/// Sets the interrupted flag and bumps the loop's unblock counter so a
/// blocked poll returns. Only the first call has any effect.
#[derive(Debug, Clone)]
pub struct StopHandle {
    interrupted: Arc<AtomicBool>,
    unblock: CounterHandle,
}

impl StopHandle {
    pub(crate) fn new(unblock: CounterHandle) -> Self {
        Self {
            interrupted: Arc::new(AtomicBool::new(false)),
            unblock,
        }
    }

    /// Request the loop to stop. Idempotent.
    pub fn stop(&self) {
        if !self.interrupted.swap(true, Ordering::AcqRel) {
            self.unblock.increment();
        }
    }

    #[inline]
    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }
}
