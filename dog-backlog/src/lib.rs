//! # dog-backlog: distributed backlog coordination
//!
//! Independent worker processes drain a shared backlog of work items with
//! no coordinator. The only shared state is three stores (locks, backlog,
//! queue) and the only coordination primitives are:
//!
//! - **Lease locks** with TTL over a store that has no compare-and-set
//! - **Race-tolerant claims**: conditional bulk update, fixed sleep, verify
//! - **At-least-once queue** with dead-letter routing
//! - **Self-replenishment**: a worker that finds the queue empty refills it
//!
//! Consistency is eventual plus TTL-bounded retry. An item is lost to a crash
//! for at most the claim TTL; it is never stranded.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use dog_backlog::prelude::*;
//! use dog_backlog::backend::memory::MemoryBackend;
//!
//! struct Print;
//!
//! #[async_trait]
//! impl ItemProcessor for Print {
//!     async fn process_batch(&self, items: &[WorkItem]) -> Result<BatchOutcome, ProcessError> {
//!         for item in items {
//!             println!("{} / {}", item.partition, item.key);
//!         }
//!         Ok(BatchOutcome::all_succeeded(items))
//!     }
//! }
//!
//! # async fn demo() -> CoordResult<()> {
//! let backend = MemoryBackend::new();
//! let source = SourceConfig::new("zillow").with_partitions(["UT", "NV"]);
//! let ctx = CoordCtx::new(backend.stores(), CoordConfig::default().with_source(source.clone()));
//!
//! let summary = WorkerLoop::new(&ctx, source, Arc::new(Print)).run().await?;
//! println!("{} items succeeded", summary.succeeded);
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod claim;
pub mod clock;
pub mod codec;
pub mod config;
pub mod error;
pub mod lock;
pub mod monitor;
pub mod observability;
pub mod processor;
pub mod queue;
pub mod replenisher;
pub mod retry;
pub mod types;
pub mod worker;

pub use backend::{BacklogStore, LockStore, QueueProvider, Stores};
pub use claim::{ClaimProtocol, ClaimedBatch};
pub use clock::{Clock, ManualClock, SystemClock};
pub use codec::json::JsonCodec;
pub use codec::PayloadCodec;
pub use config::{ConfigStore, CoordConfig, SourceConfig};
pub use error::{CoordError, CoordResult, ProcessError};
pub use lock::LeaseLock;
pub use monitor::{CleanReport, Monitor, ResetReport, StatsReport};
pub use processor::{BatchOutcome, ItemProcessor, WorkItem};
pub use queue::{DeadLetterOutcome, WorkQueue};
pub use replenisher::{JobReplenisher, ReplenishOutcome};
pub use retry::{ExponentialBackoff, LinearBackoff, RetryPolicy};
pub use types::{
    AckHandle, Attributes, BacklogItem, ClaimMarker, CoordCtx, CoordEvent, DeadLetterRecord, EnqueueLogEntry,
    FailureLogEntry, FailureReason, Lock, MessageId, OwnerId, QueueMessage, SourceStats, WorkPayload,
};
pub use worker::{RunSummary, WorkerHandle, WorkerLoop, WorkerSettings, WorkerState};

pub use observability::{LiveMetrics, MetricsSnapshot, ObservabilityLayer};

#[cfg(feature = "memory")]
pub use backend::memory::MemoryBackend;

#[cfg(feature = "sqlite")]
pub use backend::sqlite::SqliteBackend;

#[cfg(feature = "tracing-basic")]
pub use observability::init_tracing;

/// Everything needed to wire up a worker
pub mod prelude {
    pub use crate::{
        BatchOutcome, CoordConfig, CoordCtx, CoordError, CoordResult, ItemProcessor, ProcessError, RunSummary,
        SourceConfig, Stores, WorkItem, WorkerHandle, WorkerLoop,
    };

    pub use crate::{JobReplenisher, Monitor, ReplenishOutcome};

    pub use crate::{ObservabilityLayer, LiveMetrics};

    pub use async_trait::async_trait;
}
