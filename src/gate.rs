//! Single-permit gate serializing camera open and close.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::trace;

/// A counting semaphore with one permit.
///
/// At most one open-or-close transition holds the permit. The permit is a
/// [`Permit`] guard and goes back when the guard drops, so every exit path
/// releases it.
#[derive(Debug)]
pub struct OpenCloseLock {
    permits: Mutex<usize>,
    released: Condvar,
}

impl OpenCloseLock {
    /// Number of permits a fresh lock holds.
    pub const PERMITS: usize = 1;

    /// Create a lock with its permit available.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            permits: Mutex::new(Self::PERMITS),
            released: Condvar::new(),
        })
    }

    /// Wait up to `timeout` for the permit.
    pub fn try_acquire_for(self: &Arc<Self>, timeout: Duration) -> Option<Permit> {
        let deadline = Instant::now() + timeout;
        let mut permits = self.permits.lock();
        while *permits == 0 {
            if self.released.wait_until(&mut permits, deadline).timed_out() && *permits == 0 {
                trace!(?timeout, "open/close permit not acquired");
                return None;
            }
        }
        *permits -= 1;
        Some(Permit {
            lock: Arc::clone(self),
        })
    }

    /// Permits currently available.
    pub fn available_permits(&self) -> usize {
        *self.permits.lock()
    }

    fn release(&self) {
        let mut permits = self.permits.lock();
        *permits = (*permits + 1).min(Self::PERMITS);
        self.released.notify_one();
    }
}

/// Proof of holding the open/close permit. Dropping it releases the permit.
#[derive(Debug)]
#[must_use = "the permit is released as soon as it is dropped"]
pub struct Permit {
    lock: Arc<OpenCloseLock>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.lock.release();
    }
}
