use std::collections::HashMap;

use async_trait::async_trait;

use crate::types::MessageId;
use crate::ProcessError;

/// One decoded unit of work handed to a processor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub source: String,
    pub key: String,
    pub partition: String,
    pub message_id: MessageId,
}

/// Per-key results of one batch
///
/// Keys the processor does not report on are dead-lettered by the worker.
#[derive(Debug, Clone, Default)]
pub struct BatchOutcome {
    results: HashMap<String, Result<(), ProcessError>>,
}

impl BatchOutcome {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every item succeeded
    pub fn all_succeeded(items: &[WorkItem]) -> Self {
        let mut outcome = Self::new();
        for item in items {
            outcome.succeed(&item.key);
        }
        outcome
    }

    pub fn succeed(&mut self, key: &str) -> &mut Self {
        self.results.insert(key.to_string(), Ok(()));
        self
    }

    pub fn fail(&mut self, key: &str, error: ProcessError) -> &mut Self {
        self.results.insert(key.to_string(), Err(error));
        self
    }

    pub fn get(&self, key: &str) -> Option<&Result<(), ProcessError>> {
        self.results.get(key)
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

/// External processing collaborator driven by the worker loop
///
/// Returning `Err` means no per-item outcome is known; the worker then
/// dead-letters every item of the batch.
#[async_trait]
pub trait ItemProcessor: Send + Sync {
    async fn process_batch(&self, items: &[WorkItem]) -> Result<BatchOutcome, ProcessError>;
}
