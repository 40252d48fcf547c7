//! Bounded read concurrency.
//!
//! A [`ReadLimiter`] is a fair counting semaphore: permits released by a finished read are handed
//! to the oldest queued waiter, so a newly arriving read can never overtake one that was already
//! waiting. The same type bounds both the process-wide number of open reads and the per-file
//! number of open reads.

use std::sync::{Arc, OnceLock};

use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

/// Default process-wide maximum of concurrently open reads.
pub const DEFAULT_GLOBAL_READS: usize = 256;

/// Default maximum of concurrently open reads against a single file.
pub const DEFAULT_FILE_READS: usize = 8;

static GLOBAL: OnceLock<Arc<ReadLimiter>> = OnceLock::new();

/// A fair, FIFO counting semaphore over read slots.
#[derive(Debug)]
pub struct ReadLimiter {
    semaphore: Arc<Semaphore>,
    max: usize,
}

/// A held read slot. Dropping it hands the slot to the next waiter.
#[derive(Debug)]
pub struct ReadSlot {
    _permit: OwnedSemaphorePermit,
}

impl ReadLimiter {
    /// Create a limiter allowing `max` concurrent reads. A `max` of zero is treated as one so
    /// that reads can always make progress.
    #[must_use]
    pub fn new(max: usize) -> Self {
        let max = max.clamp(1, Semaphore::MAX_PERMITS);
        Self {
            semaphore: Arc::new(Semaphore::new(max)),
            max,
        }
    }

    /// The process-wide limiter shared by every cache directory that was not given its own.
    pub fn global() -> Arc<Self> {
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(Self::new(DEFAULT_GLOBAL_READS))))
    }

    /// The configured maximum.
    #[must_use]
    pub fn max(&self) -> usize {
        self.max
    }

    /// Number of slots currently held.
    #[must_use]
    pub fn in_use(&self) -> usize {
        self.max - self.semaphore.available_permits()
    }

    /// Take a slot if one is free right now.
    ///
    /// Never overtakes queued waiters: a released slot is handed to the oldest waiter before it
    /// becomes free.
    #[must_use]
    pub fn try_acquire(&self) -> Option<ReadSlot> {
        match Arc::clone(&self.semaphore).try_acquire_owned() {
            Ok(permit) => Some(ReadSlot { _permit: permit }),
            Err(TryAcquireError::NoPermits) => None,
            Err(TryAcquireError::Closed) => unreachable!("read limiter semaphores are never closed"),
        }
    }

    /// Wait for a slot.
    ///
    /// Waiters are served strictly in arrival order.
    pub async fn acquire(&self) -> ReadSlot {
        let Ok(permit) = Arc::clone(&self.semaphore).acquire_owned().await else {
            unreachable!("read limiter semaphores are never closed")
        };
        ReadSlot { _permit: permit }
    }
}
