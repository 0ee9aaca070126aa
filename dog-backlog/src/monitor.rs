//! Maintenance operations behind the `stats`, `clean` and `reset` commands.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use serde::Serialize;
use tracing::{info, instrument};

use crate::backend::{BacklogStore, LockStore};
use crate::clock::{chrono_duration, Clock};
use crate::retry::{retry_transient, RetryPolicy};
use crate::types::{CoordCtx, Lock, SourceStats};
use crate::{CoordError, CoordResult};

/// Reasons listed per source in a stats report
const TOP_FAILURE_REASONS: usize = 5;

/// Backlog progress per source plus the locks currently held
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsReport {
    pub window_hours: u64,
    pub sources: Vec<SourceStats>,
    pub active_locks: Vec<Lock>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanReport {
    pub expired_locks: u64,
    pub purged_log_entries: u64,
    pub purged_failure_entries: u64,
    pub released_claims: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResetReport {
    pub released_claims: u64,
    pub cleared_log_entries: u64,
}

pub struct Monitor {
    locks: Arc<dyn LockStore>,
    backlog: Arc<dyn BacklogStore>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    claim_ttl: Duration,
    log_retention: Duration,
}

impl Monitor {
    pub fn new(ctx: &CoordCtx) -> Self {
        let config = ctx.config();
        Self {
            locks: ctx.stores.locks.clone(),
            backlog: ctx.stores.backlog.clone(),
            clock: ctx.clock.clone(),
            retry: config.store_retry,
            claim_ttl: config.claim_ttl,
            log_retention: config.enqueue_log_retention,
        }
    }

    /// Counts for `source`, or for every source in the backlog when `None`
    #[instrument(skip(self))]
    pub async fn stats(&self, source: Option<&str>, hours: u64) -> CoordResult<StatsReport> {
        let now = self.clock.now();
        let window_start = window_start(now, hours)?;
        let stale_before = now - chrono_duration(self.claim_ttl);

        let names = match source {
            Some(name) => vec![name.to_string()],
            None => retry_transient(&self.retry, "monitor.known_sources", || self.backlog.known_sources()).await?,
        };

        let sources = try_join_all(
            names
                .iter()
                .map(|name| self.source_stats(name, window_start, stale_before)),
        )
        .await?;

        let active_locks =
            retry_transient(&self.retry, "monitor.active_locks", || self.locks.active_locks(now)).await?;

        Ok(StatsReport {
            window_hours: hours,
            sources,
            active_locks,
        })
    }

    async fn source_stats(
        &self,
        name: &str,
        window_start: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> CoordResult<SourceStats> {
        let mut stats = retry_transient(&self.retry, "monitor.source_stats", || {
            self.backlog.source_stats(name, window_start, stale_before)
        })
        .await?;
        stats.top_failure_reasons = retry_transient(&self.retry, "monitor.failure_reasons", || {
            self.backlog.failure_reasons_since(name, window_start, TOP_FAILURE_REASONS)
        })
        .await?;
        Ok(stats)
    }

    /// Drop expired locks, old enqueue-log and failure-log entries, and stale claims
    #[instrument(skip(self))]
    pub async fn clean(&self, source: Option<&str>) -> CoordResult<CleanReport> {
        let now = self.clock.now();
        let retention_cutoff = now - chrono_duration(self.log_retention);
        let stale_before = now - chrono_duration(self.claim_ttl);

        let report = CleanReport {
            expired_locks: retry_transient(&self.retry, "monitor.purge_locks", || self.locks.purge_expired(now))
                .await?,
            purged_log_entries: retry_transient(&self.retry, "monitor.purge_log", || {
                self.backlog.purge_enqueue_log(source, retention_cutoff)
            })
            .await?,
            purged_failure_entries: retry_transient(&self.retry, "monitor.purge_failures", || {
                self.backlog.purge_failure_log(source, retention_cutoff)
            })
            .await?,
            released_claims: retry_transient(&self.retry, "monitor.release_stale", || {
                self.backlog.release_stale_claims(source, stale_before)
            })
            .await?,
        };

        info!(
            expired_locks = report.expired_locks,
            purged_log_entries = report.purged_log_entries,
            purged_failure_entries = report.purged_failure_entries,
            released_claims = report.released_claims,
            "cleanup finished"
        );
        Ok(report)
    }

    /// Make work claimed or enqueued in the last `hours` claimable again
    #[instrument(skip(self))]
    pub async fn reset(&self, source: Option<&str>, hours: u64) -> CoordResult<ResetReport> {
        let since = window_start(self.clock.now(), hours)?;

        let report = ResetReport {
            released_claims: retry_transient(&self.retry, "monitor.release_recent", || {
                self.backlog.release_claims_since(source, since)
            })
            .await?,
            cleared_log_entries: retry_transient(&self.retry, "monitor.clear_log", || {
                self.backlog.delete_enqueue_log_since(source, since)
            })
            .await?,
        };

        info!(
            released_claims = report.released_claims,
            cleared_log_entries = report.cleared_log_entries,
            "reset finished"
        );
        Ok(report)
    }
}

/// `now - hours`, rejecting windows that reach past the representable range
fn window_start(now: DateTime<Utc>, hours: u64) -> CoordResult<DateTime<Utc>> {
    i64::try_from(hours)
        .ok()
        .and_then(chrono::Duration::try_hours)
        .and_then(|window| now.checked_sub_signed(window))
        .ok_or_else(|| CoordError::config(format!("window of {hours} hours is out of range")))
}

impl fmt::Display for StatsReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.sources.is_empty() {
            writeln!(f, "no backlog items")?;
        }
        for stats in &self.sources {
            writeln!(
                f,
                "{}: {}/{} complete ({:.1}%), {} pending, {} claimed",
                stats.source,
                stats.completed,
                stats.total,
                stats.percent_complete(),
                stats.pending,
                stats.claimed
            )?;
            writeln!(
                f,
                "  last {}h: {} enqueued, {} completed ({:.1}/h), {} dead-lettered ({:.1}/h)",
                self.window_hours,
                stats.enqueued_in_window,
                stats.completed_in_window,
                SourceStats::hourly_rate(stats.completed_in_window, self.window_hours),
                stats.dead_lettered_in_window,
                SourceStats::hourly_rate(stats.dead_lettered_in_window, self.window_hours)
            )?;
            for failure in &stats.top_failure_reasons {
                writeln!(f, "    {:>5}x {}", failure.count, failure.reason)?;
            }
        }
        writeln!(f, "active locks: {}", self.active_locks.len())?;
        for lock in &self.active_locks {
            writeln!(
                f,
                "  {} held by {} until {}",
                lock.name,
                lock.holder_id,
                lock.expires_at.to_rfc3339()
            )?;
        }
        Ok(())
    }
}

impl fmt::Display for CleanReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "removed {} expired locks, purged {} enqueue-log and {} failure-log entries, released {} stale claims",
            self.expired_locks, self.purged_log_entries, self.purged_failure_entries, self.released_claims
        )
    }
}

impl fmt::Display for ResetReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "released {} claims, cleared {} enqueue-log entries",
            self.released_claims, self.cleared_log_entries
        )
    }
}
