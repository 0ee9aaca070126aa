//! Lease lock over a store without compare-and-set.
//!
//! `acquire` garbage-collects expired rows, inserts a row only if no valid
//! row exists, then re-reads and confirms that the earliest valid row is the
//! caller's. Two callers can both pass the vacancy check before either
//! insert lands; the confirming read resolves that in favour of the earlier
//! `acquired_at`, but if the store does not make the second insert visible
//! in time both may believe they hold the lock. This is accepted: there is
//! one lock per source, contention is low, and the damage is bounded by the
//! TTL. Callers needing strict mutual exclusion must not use this type.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::backend::LockStore;
use crate::clock::{chrono_duration, Clock};
use crate::observability::ObservabilityLayer;
use crate::retry::{retry_transient, RetryPolicy};
use crate::types::{CoordCtx, Lock, OwnerId};
use crate::CoordResult;

pub struct LeaseLock {
    store: Arc<dyn LockStore>,
    clock: Arc<dyn Clock>,
    observability: Arc<ObservabilityLayer>,
    retry: RetryPolicy,
    holder: OwnerId,
}

impl LeaseLock {
    /// Lock handle acting on behalf of `holder`
    pub fn new(ctx: &CoordCtx, holder: OwnerId) -> Self {
        Self {
            store: ctx.stores.locks.clone(),
            clock: ctx.clock.clone(),
            observability: ctx.observability.clone(),
            retry: ctx.config.store_retry,
            holder,
        }
    }

    pub fn holder(&self) -> &OwnerId {
        &self.holder
    }

    /// Try to take `name` for `ttl`.
    ///
    /// Returns `Ok(true)` only if the confirming read shows this holder owns
    /// the earliest valid row, which includes re-acquiring a lock it already
    /// holds. Store errors that survive the retry budget are returned as
    /// transient "try later" signals.
    #[instrument(skip(self), fields(holder = %self.holder))]
    pub async fn acquire(&self, name: &str, ttl: Duration) -> CoordResult<bool> {
        let now = self.clock.now();

        let collected = retry_transient(&self.retry, "lock.delete_expired", || {
            self.store.delete_expired(name, now)
        })
        .await?;
        if collected > 0 {
            debug!(lock = name, collected, "removed expired lock rows");
        }

        let lock = Lock {
            name: name.to_string(),
            holder_id: self.holder.clone(),
            acquired_at: now,
            expires_at: now + chrono_duration(ttl),
        };
        let inserted = retry_transient(&self.retry, "lock.insert_if_vacant", || {
            self.store.insert_if_vacant(&lock, now)
        })
        .await?;

        let valid = retry_transient(&self.retry, "lock.valid_locks", || self.store.valid_locks(name, now)).await?;
        let confirmed = valid.first().map_or(false, |row| row.holder_id == self.holder);

        if confirmed {
            info!(lock = name, expires_at = %lock.expires_at, "lock acquired");
        } else {
            let current = valid.first().map(|row| row.holder_id.to_string());
            if inserted {
                warn!(lock = name, ?current, "inserted lock row lost the confirming read");
            } else {
                debug!(lock = name, ?current, "lock held by another process");
            }
        }

        self.observability.record_lock(name, &self.holder, confirmed, now);
        Ok(confirmed)
    }

    /// Delete `name` iff it is held by `holder_id`; returns whether a row was removed
    #[instrument(skip(self))]
    pub async fn release(&self, name: &str, holder_id: &OwnerId) -> CoordResult<bool> {
        let removed = retry_transient(&self.retry, "lock.delete_held", || {
            self.store.delete_held(name, holder_id)
        })
        .await?;

        if removed {
            info!(lock = name, "lock released");
            self.observability.record_lock_released(name, holder_id, self.clock.now());
        } else {
            debug!(lock = name, "no lock row held by this holder");
        }
        Ok(removed)
    }
}
