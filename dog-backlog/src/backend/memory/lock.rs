use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use super::Faults;
use crate::backend::LockStore;
use crate::types::{Lock, OwnerId};
use crate::CoordResult;

/// Lock table kept as a plain row list; several rows per name are possible
#[derive(Debug, Default)]
pub struct MemoryLockStore {
    rows: RwLock<Vec<Lock>>,
    faults: Faults,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn by_acquisition(a: &Lock, b: &Lock) -> std::cmp::Ordering {
    a.acquired_at
        .cmp(&b.acquired_at)
        .then_with(|| a.holder_id.cmp(&b.holder_id))
}

#[async_trait]
impl LockStore for MemoryLockStore {
    async fn delete_expired(&self, name: &str, now: DateTime<Utc>) -> CoordResult<u64> {
        self.faults.check("delete_expired")?;
        let mut rows = self.rows.write();
        let before = rows.len();
        rows.retain(|lock| lock.name != name || lock.expires_at >= now);
        Ok((before - rows.len()) as u64)
    }

    async fn insert_if_vacant(&self, lock: &Lock, now: DateTime<Utc>) -> CoordResult<bool> {
        self.faults.check("insert_if_vacant")?;
        let mut rows = self.rows.write();
        if rows.iter().any(|row| row.name == lock.name && row.is_valid_at(now)) {
            return Ok(false);
        }
        rows.push(lock.clone());
        Ok(true)
    }

    async fn valid_locks(&self, name: &str, now: DateTime<Utc>) -> CoordResult<Vec<Lock>> {
        self.faults.check("valid_locks")?;
        let mut valid: Vec<Lock> = self
            .rows
            .read()
            .iter()
            .filter(|row| row.name == name && row.is_valid_at(now))
            .cloned()
            .collect();
        valid.sort_by(by_acquisition);
        Ok(valid)
    }

    async fn delete_held(&self, name: &str, holder: &OwnerId) -> CoordResult<bool> {
        self.faults.check("delete_held")?;
        let mut rows = self.rows.write();
        let before = rows.len();
        rows.retain(|row| !(row.name == name && &row.holder_id == holder));
        Ok(rows.len() != before)
    }

    async fn active_locks(&self, now: DateTime<Utc>) -> CoordResult<Vec<Lock>> {
        self.faults.check("active_locks")?;
        let mut valid: Vec<Lock> = self
            .rows
            .read()
            .iter()
            .filter(|row| row.is_valid_at(now))
            .cloned()
            .collect();
        valid.sort_by(by_acquisition);
        Ok(valid)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> CoordResult<u64> {
        self.faults.check("purge_expired")?;
        let mut rows = self.rows.write();
        let before = rows.len();
        rows.retain(|row| row.expires_at >= now);
        Ok((before - rows.len()) as u64)
    }
}

/// Test helpers for deterministic testing
impl MemoryLockStore {
    /// Fail the next `count` calls with a transient error
    pub fn fail_next(&self, count: u32) {
        self.faults.arm(count);
    }

    /// Write a row without the vacancy check, as a racing insert would
    pub fn insert_unchecked(&self, lock: Lock) {
        self.rows.write().push(lock);
    }

    /// Every row, expired or not
    pub fn rows(&self) -> Vec<Lock> {
        self.rows.read().clone()
    }
}
