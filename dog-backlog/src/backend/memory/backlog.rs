use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rand::seq::SliceRandom;

use super::Faults;
use crate::backend::BacklogStore;
use crate::types::{
    BacklogItem, ClaimFilter, ClaimMarker, EnqueueLogEntry, FailureLogEntry, FailureReason, OwnerId, SourceStats,
};
use crate::CoordResult;

// (source, key) -> item
type ItemMap = HashMap<(String, String), BacklogItem>;

/// Backlog table, enqueue log and failure log held in process memory
#[derive(Debug, Default)]
pub struct MemoryBacklogStore {
    items: RwLock<ItemMap>,
    log: RwLock<Vec<EnqueueLogEntry>>,
    failures: RwLock<Vec<FailureLogEntry>>,
    faults: Faults,
}

impl MemoryBacklogStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn recent_keys(&self, source: &str, since: DateTime<Utc>) -> HashSet<String> {
        self.log
            .read()
            .iter()
            .filter(|entry| entry.source == source && entry.enqueued_at >= since)
            .map(|entry| entry.key.clone())
            .collect()
    }
}

fn in_scope(item: &BacklogItem, source: Option<&str>) -> bool {
    source.map_or(true, |s| item.source == s)
}

fn clear_claim(item: &mut BacklogItem) {
    item.claim_owner = None;
    item.claim_timestamp = None;
}

#[async_trait]
impl BacklogStore for MemoryBacklogStore {
    async fn insert_items(&self, items: &[BacklogItem]) -> CoordResult<u64> {
        self.faults.check("insert_items")?;
        let mut map = self.items.write();
        let mut inserted = 0;
        for item in items {
            let id = (item.source.clone(), item.key.clone());
            if !map.contains_key(&id) {
                map.insert(id, item.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn get_item(&self, source: &str, key: &str) -> CoordResult<Option<BacklogItem>> {
        self.faults.check("get_item")?;
        Ok(self
            .items
            .read()
            .get(&(source.to_string(), key.to_string()))
            .cloned())
    }

    async fn mark_claims(
        &self,
        source: &str,
        filter: &ClaimFilter,
        marker: &ClaimMarker,
        limit: usize,
    ) -> CoordResult<u64> {
        self.faults.check("mark_claims")?;
        let recent = self.recent_keys(source, filter.enqueued_since);

        let mut items = self.items.write();
        let mut candidates: Vec<(String, String)> = items
            .iter()
            .filter(|(_, item)| {
                item.source == source
                    && filter.matches_partition(&item.partition)
                    && item.is_claimable(filter.stale_before)
                    && !recent.contains(&item.key)
            })
            .map(|(id, _)| id.clone())
            .collect();

        candidates.shuffle(&mut rand::thread_rng());
        candidates.truncate(limit);

        for id in &candidates {
            if let Some(item) = items.get_mut(id) {
                item.claim_owner = Some(marker.owner.clone());
                item.claim_timestamp = Some(marker.stamp);
            }
        }
        Ok(candidates.len() as u64)
    }

    async fn claimed_by(&self, source: &str, marker: &ClaimMarker) -> CoordResult<Vec<BacklogItem>> {
        self.faults.check("claimed_by")?;
        Ok(self
            .items
            .read()
            .values()
            .filter(|item| item.source == source && !item.is_completed() && item.is_held_by(marker))
            .cloned()
            .collect())
    }

    async fn count_claimable(&self, source: &str, filter: &ClaimFilter) -> CoordResult<u64> {
        self.faults.check("count_claimable")?;
        Ok(self
            .items
            .read()
            .values()
            .filter(|item| {
                item.source == source
                    && filter.matches_partition(&item.partition)
                    && item.is_claimable(filter.stale_before)
            })
            .count() as u64)
    }

    async fn count_completed_since(&self, source: &str, since: DateTime<Utc>) -> CoordResult<u64> {
        self.faults.check("count_completed_since")?;
        Ok(self
            .items
            .read()
            .values()
            .filter(|item| item.source == source && item.completion_marker.map_or(false, |at| at >= since))
            .count() as u64)
    }

    async fn completed_keys(&self, source: &str, keys: &[String]) -> CoordResult<HashSet<String>> {
        self.faults.check("completed_keys")?;
        let items = self.items.read();
        Ok(keys
            .iter()
            .filter(|key| {
                items
                    .get(&(source.to_string(), (*key).clone()))
                    .map_or(false, BacklogItem::is_completed)
            })
            .cloned()
            .collect())
    }

    async fn mark_completed(&self, source: &str, key: &str, at: DateTime<Utc>) -> CoordResult<bool> {
        self.faults.check("mark_completed")?;
        let mut items = self.items.write();
        match items.get_mut(&(source.to_string(), key.to_string())) {
            Some(item) if item.completion_marker.is_none() => {
                item.completion_marker = Some(at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_stale_claims(&self, source: Option<&str>, stale_before: DateTime<Utc>) -> CoordResult<u64> {
        self.faults.check("release_stale_claims")?;
        let mut released = 0;
        for item in self.items.write().values_mut() {
            if in_scope(item, source)
                && !item.is_completed()
                && item.claim_timestamp.map_or(false, |stamp| stamp <= stale_before)
            {
                clear_claim(item);
                released += 1;
            }
        }
        Ok(released)
    }

    async fn release_claims_since(&self, source: Option<&str>, since: DateTime<Utc>) -> CoordResult<u64> {
        self.faults.check("release_claims_since")?;
        let mut released = 0;
        for item in self.items.write().values_mut() {
            if in_scope(item, source)
                && !item.is_completed()
                && item.claim_timestamp.map_or(false, |stamp| stamp >= since)
            {
                clear_claim(item);
                released += 1;
            }
        }
        Ok(released)
    }

    async fn record_enqueued(&self, entries: &[EnqueueLogEntry]) -> CoordResult<()> {
        self.faults.check("record_enqueued")?;
        self.log.write().extend_from_slice(entries);
        Ok(())
    }

    async fn recently_enqueued(
        &self,
        source: &str,
        keys: &[String],
        since: DateTime<Utc>,
    ) -> CoordResult<HashSet<String>> {
        self.faults.check("recently_enqueued")?;
        let recent = self.recent_keys(source, since);
        Ok(keys.iter().filter(|k| recent.contains(*k)).cloned().collect())
    }

    async fn count_enqueued_since(&self, source: &str, since: DateTime<Utc>) -> CoordResult<u64> {
        self.faults.check("count_enqueued_since")?;
        Ok(self.recent_keys(source, since).len() as u64)
    }

    async fn purge_enqueue_log(&self, source: Option<&str>, before: DateTime<Utc>) -> CoordResult<u64> {
        self.faults.check("purge_enqueue_log")?;
        let mut log = self.log.write();
        let len = log.len();
        log.retain(|entry| !(source.map_or(true, |s| entry.source == s) && entry.enqueued_at < before));
        Ok((len - log.len()) as u64)
    }

    async fn delete_enqueue_log_since(&self, source: Option<&str>, since: DateTime<Utc>) -> CoordResult<u64> {
        self.faults.check("delete_enqueue_log_since")?;
        let mut log = self.log.write();
        let len = log.len();
        log.retain(|entry| !(source.map_or(true, |s| entry.source == s) && entry.enqueued_at >= since));
        Ok((len - log.len()) as u64)
    }

    async fn record_failure(&self, entry: &FailureLogEntry) -> CoordResult<()> {
        self.faults.check("record_failure")?;
        self.failures.write().push(entry.clone());
        Ok(())
    }

    async fn failure_reasons_since(
        &self,
        source: &str,
        since: DateTime<Utc>,
        limit: usize,
    ) -> CoordResult<Vec<FailureReason>> {
        self.faults.check("failure_reasons_since")?;
        let mut counts: HashMap<String, u64> = HashMap::new();
        for entry in self
            .failures
            .read()
            .iter()
            .filter(|entry| entry.source == source && entry.failed_at >= since)
        {
            *counts.entry(entry.reason.clone()).or_default() += 1;
        }

        let mut reasons: Vec<FailureReason> = counts
            .into_iter()
            .map(|(reason, count)| FailureReason { reason, count })
            .collect();
        reasons.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.reason.cmp(&b.reason)));
        reasons.truncate(limit);
        Ok(reasons)
    }

    async fn purge_failure_log(&self, source: Option<&str>, before: DateTime<Utc>) -> CoordResult<u64> {
        self.faults.check("purge_failure_log")?;
        let mut failures = self.failures.write();
        let len = failures.len();
        failures.retain(|entry| !(source.map_or(true, |s| entry.source == s) && entry.failed_at < before));
        Ok((len - failures.len()) as u64)
    }

    async fn source_stats(
        &self,
        source: &str,
        window_start: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> CoordResult<SourceStats> {
        self.faults.check("source_stats")?;
        let dead_lettered_in_window = self
            .failures
            .read()
            .iter()
            .filter(|entry| entry.source == source && entry.failed_at >= window_start)
            .count() as u64;
        let mut stats = SourceStats {
            source: source.to_string(),
            enqueued_in_window: self.recent_keys(source, window_start).len() as u64,
            dead_lettered_in_window,
            ..SourceStats::default()
        };

        for item in self.items.read().values().filter(|item| item.source == source) {
            stats.total += 1;
            match item.completion_marker {
                Some(at) => {
                    stats.completed += 1;
                    if at >= window_start {
                        stats.completed_in_window += 1;
                    }
                }
                None => {
                    stats.pending += 1;
                    if !item.claim_expired(stale_before) {
                        stats.claimed += 1;
                    }
                }
            }
        }
        Ok(stats)
    }

    async fn known_sources(&self) -> CoordResult<Vec<String>> {
        self.faults.check("known_sources")?;
        let mut sources: Vec<String> = self
            .items
            .read()
            .values()
            .map(|item| item.source.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        sources.sort();
        Ok(sources)
    }
}

/// Test helpers for deterministic testing
impl MemoryBacklogStore {
    /// Fail the next `count` calls with a transient error
    pub fn fail_next(&self, count: u32) {
        self.faults.arm(count);
    }

    /// Overwrite an item's claim marker, as a competing claimant's update would
    pub fn force_claim(&self, source: &str, key: &str, marker: &ClaimMarker) {
        if let Some(item) = self.items.write().get_mut(&(source.to_string(), key.to_string())) {
            item.claim_owner = Some(marker.owner.clone());
            item.claim_timestamp = Some(marker.stamp);
        }
    }

    /// Keys currently carrying a claim by `owner`, regardless of age
    pub fn keys_claimed_by(&self, source: &str, owner: &OwnerId) -> Vec<String> {
        let mut keys: Vec<String> = self
            .items
            .read()
            .values()
            .filter(|item| item.source == source && item.claim_owner.as_ref() == Some(owner))
            .map(|item| item.key.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Every item of `source`, sorted by key
    pub fn items(&self, source: &str) -> Vec<BacklogItem> {
        let mut items: Vec<BacklogItem> = self
            .items
            .read()
            .values()
            .filter(|item| item.source == source)
            .cloned()
            .collect();
        items.sort_by(|a, b| a.key.cmp(&b.key));
        items
    }

    pub fn enqueue_log(&self) -> Vec<EnqueueLogEntry> {
        self.log.read().clone()
    }

    pub fn failure_log(&self) -> Vec<FailureLogEntry> {
        self.failures.read().clone()
    }
}
