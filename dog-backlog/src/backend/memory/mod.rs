//! In-memory stores for tests, development and single-process deployments.
//!
//! Each store exposes test helpers (fault injection, forced claim overwrite,
//! forced delivery expiry) so race and failure paths can be driven
//! deterministically.

pub mod backlog;
pub mod lock;
pub mod queue;

pub use backlog::MemoryBacklogStore;
pub use lock::MemoryLockStore;
pub use queue::{MemoryQueue, PublishedMessage};

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::backend::Stores;
use crate::{CoordError, CoordResult};

/// All three memory stores, sharing nothing but the process
#[derive(Clone, Default)]
pub struct MemoryBackend {
    pub locks: Arc<MemoryLockStore>,
    pub backlog: Arc<MemoryBacklogStore>,
    pub queue: Arc<MemoryQueue>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stores(&self) -> Stores {
        Stores::new(self.locks.clone(), self.backlog.clone(), self.queue.clone())
    }
}

/// Countdown of injected transient failures
#[derive(Debug, Default)]
pub(crate) struct Faults {
    remaining: AtomicU32,
}

impl Faults {
    pub(crate) fn arm(&self, count: u32) {
        self.remaining.store(count, Ordering::SeqCst);
    }

    /// Consume one armed failure, if any
    pub(crate) fn check(&self, operation: &str) -> CoordResult<()> {
        match self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        {
            Ok(_) => Err(CoordError::TransientStore(format!(
                "injected failure in {operation}"
            ))),
            Err(_) => Ok(()),
        }
    }
}
