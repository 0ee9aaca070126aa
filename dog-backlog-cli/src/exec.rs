//! Processing collaborator that runs an external command per key.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use dog_backlog::{BatchOutcome, ItemProcessor, ProcessError, WorkItem};

/// Longest stderr excerpt carried into a dead-letter reason
const STDERR_EXCERPT: usize = 512;

/// Runs `program args.. <key>` with `BACKLOG_SOURCE` and `BACKLOG_PARTITION` set.
///
/// Exit status 0 is success and any other status fails that item. A command
/// that cannot be started fails the whole batch while no item has run yet;
/// after that it only fails the item at hand.
#[derive(Debug, Clone)]
pub struct ExecProcessor {
    program: String,
    args: Vec<String>,
}

impl ExecProcessor {
    /// Split `command` on whitespace; no shell quoting is interpreted
    pub fn parse(command: &str) -> Option<Self> {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self {
            program,
            args: parts.collect(),
        })
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    async fn run_one(&self, item: &WorkItem) -> Result<Result<(), ProcessError>, ProcessError> {
        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(&item.key)
            .env("BACKLOG_SOURCE", &item.source)
            .env("BACKLOG_PARTITION", &item.partition)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| ProcessError::batch_fatal(format!("failed to start {}: {}", self.program, e)))?;

        if output.status.success() {
            debug!(key = %item.key, "command succeeded");
            return Ok(Ok(()));
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let excerpt: String = stderr.trim().chars().take(STDERR_EXCERPT).collect();
        warn!(key = %item.key, status = %output.status, "command failed");
        let reason = if excerpt.is_empty() {
            format!("{} exited with {}", self.program, output.status)
        } else {
            format!("{} exited with {}: {}", self.program, output.status, excerpt)
        };
        Ok(Err(ProcessError::permanent(reason)))
    }
}

#[async_trait]
impl ItemProcessor for ExecProcessor {
    async fn process_batch(&self, items: &[WorkItem]) -> Result<BatchOutcome, ProcessError> {
        let mut outcome = BatchOutcome::new();
        for item in items {
            record(&mut outcome, &item.key, self.run_one(item).await)?;
        }
        Ok(outcome)
    }
}

/// Fold one command result into `outcome`.
///
/// A start failure is batch-fatal only while `outcome` is empty, so the
/// results of items that already ran are never discarded.
fn record(
    outcome: &mut BatchOutcome,
    key: &str,
    result: Result<Result<(), ProcessError>, ProcessError>,
) -> Result<(), ProcessError> {
    match result {
        Ok(Ok(())) => {
            outcome.succeed(key);
        }
        Ok(Err(err)) => {
            outcome.fail(key, err);
        }
        Err(err) if outcome.is_empty() => return Err(err),
        Err(err) => {
            warn!(key, "command could not be started: {}", err);
            outcome.fail(key, ProcessError::permanent(err.message()));
        }
    }
    Ok(())
}
