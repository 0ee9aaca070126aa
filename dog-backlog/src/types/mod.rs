pub mod backlog;
pub mod ctx;
pub mod events;
pub mod ids;
pub mod lock;
pub mod message;

pub use backlog::{BacklogItem, ClaimFilter, ClaimMarker, EnqueueLogEntry, FailureLogEntry, FailureReason, SourceStats};
pub use ctx::CoordCtx;
pub use events::CoordEvent;
pub use ids::{AckHandle, MessageId, OwnerId};
pub use lock::Lock;
pub use message::{Attributes, DeadLetterRecord, QueueMessage, WorkPayload, CODEC_ATTRIBUTE, SOURCE_ATTRIBUTE};
