//! SQLite stores shared by several worker processes on one host.
//!
//! Timestamps are stored as integer epoch microseconds so that claim markers
//! compare exactly. The lock table has no uniqueness constraint; several rows
//! per name may coexist, exactly as the lease lock expects.

use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};

use crate::backend::{BacklogStore, LockStore, QueueProvider, Stores};
use crate::types::{
    AckHandle, Attributes, BacklogItem, ClaimFilter, ClaimMarker, EnqueueLogEntry, FailureLogEntry, FailureReason,
    Lock, MessageId, OwnerId, QueueMessage, SourceStats,
};
use crate::{CoordError, CoordResult};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS locks (
        name         TEXT NOT NULL,
        holder_id    TEXT NOT NULL,
        acquired_at  INTEGER NOT NULL,
        expires_at   INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS locks_name ON locks (name, expires_at)",
    r#"
    CREATE TABLE IF NOT EXISTS backlog_items (
        source             TEXT NOT NULL,
        key                TEXT NOT NULL,
        partition          TEXT NOT NULL,
        completion_marker  INTEGER NULL,
        claim_owner        TEXT NULL,
        claim_timestamp    INTEGER NULL,
        PRIMARY KEY (source, key)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS backlog_items_claim ON backlog_items (source, claim_owner, claim_timestamp)",
    r#"
    CREATE TABLE IF NOT EXISTS enqueue_log (
        id           INTEGER PRIMARY KEY AUTOINCREMENT,
        source       TEXT NOT NULL,
        key          TEXT NOT NULL,
        enqueued_at  INTEGER NOT NULL,
        owner        TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS enqueue_log_recent ON enqueue_log (source, enqueued_at)",
    r#"
    CREATE TABLE IF NOT EXISTS failure_log (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        source      TEXT NOT NULL,
        key         TEXT NULL,
        message_id  TEXT NOT NULL,
        reason      TEXT NOT NULL,
        failed_at   INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS failure_log_recent ON failure_log (source, failed_at)",
    r#"
    CREATE TABLE IF NOT EXISTS queue_messages (
        id            INTEGER PRIMARY KEY AUTOINCREMENT,
        message_id    TEXT NOT NULL UNIQUE,
        topic         TEXT NOT NULL,
        payload       BLOB NOT NULL,
        attributes    TEXT NOT NULL,
        publish_time  INTEGER NOT NULL,
        ack_handle    TEXT NULL,
        visible_at    INTEGER NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS queue_messages_topic ON queue_messages (topic, visible_at)",
];

// Shared by mark_claims and count_claimable; binds: source, stale_before,
// partitions-empty flag, partitions json
const CLAIMABLE: &str = r#"
    source = ?
    AND completion_marker IS NULL
    AND (claim_owner IS NULL OR claim_timestamp IS NULL OR claim_timestamp <= ?)
    AND (? = 1 OR partition IN (SELECT value FROM json_each(?)))
"#;

/// All three stores over one SQLite database
#[derive(Debug, Clone)]
pub struct SqliteBackend {
    pool: SqlitePool,
}

impl SqliteBackend {
    /// Open (creating if missing) the database at `url`
    pub async fn connect(url: &str) -> CoordResult<Self> {
        let in_memory = url.contains(":memory:");
        let mut options = SqliteConnectOptions::from_str(url)
            .map_err(|e| CoordError::config(format!("invalid database url {url}: {e}")))?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));
        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        // Every connection to :memory: would open a separate database
        let pool = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { 5 })
            .connect_with(options)
            .await?;

        info!(url, "connected to sqlite");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create tables and indexes if they do not exist
    pub async fn migrate(&self) -> CoordResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        debug!("sqlite schema ready");
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn stores(&self) -> Stores {
        Stores::new(
            Arc::new(self.clone()),
            Arc::new(self.clone()),
            Arc::new(self.clone()),
        )
    }
}

fn micros(at: DateTime<Utc>) -> i64 {
    at.timestamp_micros()
}

fn from_micros(value: i64) -> CoordResult<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_micros(value)
        .ok_or_else(|| CoordError::Serialization(format!("timestamp out of range: {value}")))
}

fn from_micros_opt(value: Option<i64>) -> CoordResult<Option<DateTime<Utc>>> {
    value.map(from_micros).transpose()
}

fn lock_from_row(row: &SqliteRow) -> CoordResult<Lock> {
    Ok(Lock {
        name: row.try_get("name")?,
        holder_id: OwnerId(row.try_get("holder_id")?),
        acquired_at: from_micros(row.try_get("acquired_at")?)?,
        expires_at: from_micros(row.try_get("expires_at")?)?,
    })
}

fn item_from_row(row: &SqliteRow) -> CoordResult<BacklogItem> {
    Ok(BacklogItem {
        source: row.try_get("source")?,
        key: row.try_get("key")?,
        partition: row.try_get("partition")?,
        completion_marker: from_micros_opt(row.try_get("completion_marker")?)?,
        claim_owner: row.try_get::<Option<String>, _>("claim_owner")?.map(OwnerId),
        claim_timestamp: from_micros_opt(row.try_get("claim_timestamp")?)?,
    })
}

fn reason_from_row(row: &SqliteRow) -> CoordResult<FailureReason> {
    Ok(FailureReason {
        reason: row.try_get("reason")?,
        count: row.try_get::<i64, _>("count")? as u64,
    })
}

fn partition_args(filter: &ClaimFilter) -> CoordResult<(i64, String)> {
    let all = i64::from(filter.partitions.is_empty());
    Ok((all, serde_json::to_string(&filter.partitions)?))
}

#[async_trait]
impl LockStore for SqliteBackend {
    async fn delete_expired(&self, name: &str, now: DateTime<Utc>) -> CoordResult<u64> {
        let result = sqlx::query("DELETE FROM locks WHERE name = ? AND expires_at < ?")
            .bind(name)
            .bind(micros(now))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn insert_if_vacant(&self, lock: &Lock, now: DateTime<Utc>) -> CoordResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO locks (name, holder_id, acquired_at, expires_at)
            SELECT ?, ?, ?, ?
            WHERE NOT EXISTS (SELECT 1 FROM locks WHERE name = ? AND expires_at > ?)
            "#,
        )
        .bind(&lock.name)
        .bind(lock.holder_id.as_str())
        .bind(micros(lock.acquired_at))
        .bind(micros(lock.expires_at))
        .bind(&lock.name)
        .bind(micros(now))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn valid_locks(&self, name: &str, now: DateTime<Utc>) -> CoordResult<Vec<Lock>> {
        let rows = sqlx::query(
            "SELECT * FROM locks WHERE name = ? AND expires_at > ? ORDER BY acquired_at, holder_id",
        )
        .bind(name)
        .bind(micros(now))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(lock_from_row).collect()
    }

    async fn delete_held(&self, name: &str, holder: &OwnerId) -> CoordResult<bool> {
        let result = sqlx::query("DELETE FROM locks WHERE name = ? AND holder_id = ?")
            .bind(name)
            .bind(holder.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn active_locks(&self, now: DateTime<Utc>) -> CoordResult<Vec<Lock>> {
        let rows = sqlx::query("SELECT * FROM locks WHERE expires_at > ? ORDER BY acquired_at, holder_id")
            .bind(micros(now))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(lock_from_row).collect()
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> CoordResult<u64> {
        let result = sqlx::query("DELETE FROM locks WHERE expires_at < ?")
            .bind(micros(now))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl BacklogStore for SqliteBackend {
    async fn insert_items(&self, items: &[BacklogItem]) -> CoordResult<u64> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;
        for item in items {
            let result = sqlx::query(
                r#"
                INSERT INTO backlog_items
                    (source, key, partition, completion_marker, claim_owner, claim_timestamp)
                VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT (source, key) DO NOTHING
                "#,
            )
            .bind(&item.source)
            .bind(&item.key)
            .bind(&item.partition)
            .bind(item.completion_marker.map(micros))
            .bind(item.claim_owner.as_ref().map(OwnerId::as_str))
            .bind(item.claim_timestamp.map(micros))
            .execute(&mut *tx)
            .await?;
            inserted += result.rows_affected();
        }
        tx.commit().await?;
        Ok(inserted)
    }

    async fn get_item(&self, source: &str, key: &str) -> CoordResult<Option<BacklogItem>> {
        let row = sqlx::query("SELECT * FROM backlog_items WHERE source = ? AND key = ?")
            .bind(source)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(item_from_row).transpose()
    }

    async fn mark_claims(
        &self,
        source: &str,
        filter: &ClaimFilter,
        marker: &ClaimMarker,
        limit: usize,
    ) -> CoordResult<u64> {
        let (all_partitions, partitions) = partition_args(filter)?;
        let sql = format!(
            r#"
            UPDATE backlog_items SET claim_owner = ?, claim_timestamp = ?
            WHERE source = ? AND key IN (
                SELECT key FROM backlog_items
                WHERE {CLAIMABLE}
                  AND key NOT IN (SELECT key FROM enqueue_log WHERE source = ? AND enqueued_at >= ?)
                ORDER BY RANDOM()
                LIMIT ?
            )
            "#
        );

        let result = sqlx::query(&sql)
            .bind(marker.owner.as_str())
            .bind(micros(marker.stamp))
            .bind(source)
            .bind(source)
            .bind(micros(filter.stale_before))
            .bind(all_partitions)
            .bind(partitions)
            .bind(source)
            .bind(micros(filter.enqueued_since))
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn claimed_by(&self, source: &str, marker: &ClaimMarker) -> CoordResult<Vec<BacklogItem>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM backlog_items
            WHERE source = ? AND completion_marker IS NULL AND claim_owner = ? AND claim_timestamp = ?
            "#,
        )
        .bind(source)
        .bind(marker.owner.as_str())
        .bind(micros(marker.stamp))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(item_from_row).collect()
    }

    async fn count_claimable(&self, source: &str, filter: &ClaimFilter) -> CoordResult<u64> {
        let (all_partitions, partitions) = partition_args(filter)?;
        let sql = format!("SELECT COUNT(*) FROM backlog_items WHERE {CLAIMABLE}");
        let count: i64 = sqlx::query_scalar(&sql)
            .bind(source)
            .bind(micros(filter.stale_before))
            .bind(all_partitions)
            .bind(partitions)
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    async fn count_completed_since(&self, source: &str, since: DateTime<Utc>) -> CoordResult<u64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM backlog_items WHERE source = ? AND completion_marker >= ?")
                .bind(source)
                .bind(micros(since))
                .fetch_one(&self.pool)
                .await?;
        Ok(count as u64)
    }

    async fn completed_keys(&self, source: &str, keys: &[String]) -> CoordResult<HashSet<String>> {
        if keys.is_empty() {
            return Ok(HashSet::new());
        }
        let completed: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT key FROM backlog_items
            WHERE source = ? AND completion_marker IS NOT NULL AND key IN (SELECT value FROM json_each(?))
            "#,
        )
        .bind(source)
        .bind(serde_json::to_string(keys)?)
        .fetch_all(&self.pool)
        .await?;
        Ok(completed.into_iter().collect())
    }

    async fn mark_completed(&self, source: &str, key: &str, at: DateTime<Utc>) -> CoordResult<bool> {
        let result = sqlx::query(
            "UPDATE backlog_items SET completion_marker = ? WHERE source = ? AND key = ? AND completion_marker IS NULL",
        )
        .bind(micros(at))
        .bind(source)
        .bind(key)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn release_stale_claims(&self, source: Option<&str>, stale_before: DateTime<Utc>) -> CoordResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE backlog_items SET claim_owner = NULL, claim_timestamp = NULL
            WHERE (? IS NULL OR source = ?)
              AND completion_marker IS NULL
              AND claim_timestamp IS NOT NULL
              AND claim_timestamp <= ?
            "#,
        )
        .bind(source)
        .bind(source)
        .bind(micros(stale_before))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn release_claims_since(&self, source: Option<&str>, since: DateTime<Utc>) -> CoordResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE backlog_items SET claim_owner = NULL, claim_timestamp = NULL
            WHERE (? IS NULL OR source = ?)
              AND completion_marker IS NULL
              AND claim_timestamp >= ?
            "#,
        )
        .bind(source)
        .bind(source)
        .bind(micros(since))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn record_enqueued(&self, entries: &[EnqueueLogEntry]) -> CoordResult<()> {
        let mut tx = self.pool.begin().await?;
        for entry in entries {
            sqlx::query("INSERT INTO enqueue_log (source, key, enqueued_at, owner) VALUES (?, ?, ?, ?)")
                .bind(&entry.source)
                .bind(&entry.key)
                .bind(micros(entry.enqueued_at))
                .bind(entry.owner.as_str())
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn recently_enqueued(
        &self,
        source: &str,
        keys: &[String],
        since: DateTime<Utc>,
    ) -> CoordResult<HashSet<String>> {
        if keys.is_empty() {
            return Ok(HashSet::new());
        }
        let recent: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT DISTINCT key FROM enqueue_log
            WHERE source = ? AND enqueued_at >= ? AND key IN (SELECT value FROM json_each(?))
            "#,
        )
        .bind(source)
        .bind(micros(since))
        .bind(serde_json::to_string(keys)?)
        .fetch_all(&self.pool)
        .await?;
        Ok(recent.into_iter().collect())
    }

    async fn count_enqueued_since(&self, source: &str, since: DateTime<Utc>) -> CoordResult<u64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(DISTINCT key) FROM enqueue_log WHERE source = ? AND enqueued_at >= ?")
                .bind(source)
                .bind(micros(since))
                .fetch_one(&self.pool)
                .await?;
        Ok(count as u64)
    }

    async fn purge_enqueue_log(&self, source: Option<&str>, before: DateTime<Utc>) -> CoordResult<u64> {
        let result = sqlx::query("DELETE FROM enqueue_log WHERE (? IS NULL OR source = ?) AND enqueued_at < ?")
            .bind(source)
            .bind(source)
            .bind(micros(before))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn delete_enqueue_log_since(&self, source: Option<&str>, since: DateTime<Utc>) -> CoordResult<u64> {
        let result = sqlx::query("DELETE FROM enqueue_log WHERE (? IS NULL OR source = ?) AND enqueued_at >= ?")
            .bind(source)
            .bind(source)
            .bind(micros(since))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn record_failure(&self, entry: &FailureLogEntry) -> CoordResult<()> {
        sqlx::query("INSERT INTO failure_log (source, key, message_id, reason, failed_at) VALUES (?, ?, ?, ?, ?)")
            .bind(&entry.source)
            .bind(entry.key.as_deref())
            .bind(entry.message_id.as_str())
            .bind(&entry.reason)
            .bind(micros(entry.failed_at))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn failure_reasons_since(
        &self,
        source: &str,
        since: DateTime<Utc>,
        limit: usize,
    ) -> CoordResult<Vec<FailureReason>> {
        let rows = sqlx::query(
            r#"
            SELECT reason, COUNT(*) AS count FROM failure_log
            WHERE source = ? AND failed_at >= ?
            GROUP BY reason
            ORDER BY count DESC, reason
            LIMIT ?
            "#,
        )
        .bind(source)
        .bind(micros(since))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(reason_from_row).collect()
    }

    async fn purge_failure_log(&self, source: Option<&str>, before: DateTime<Utc>) -> CoordResult<u64> {
        let result = sqlx::query("DELETE FROM failure_log WHERE (? IS NULL OR source = ?) AND failed_at < ?")
            .bind(source)
            .bind(source)
            .bind(micros(before))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn source_stats(
        &self,
        source: &str,
        window_start: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> CoordResult<SourceStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS total,
                COALESCE(SUM(completion_marker IS NOT NULL), 0) AS completed,
                COALESCE(SUM(completion_marker IS NOT NULL AND completion_marker >= ?), 0) AS completed_in_window,
                COALESCE(SUM(
                    completion_marker IS NULL
                    AND claim_owner IS NOT NULL
                    AND claim_timestamp IS NOT NULL
                    AND claim_timestamp > ?
                ), 0) AS claimed
            FROM backlog_items
            WHERE source = ?
            "#,
        )
        .bind(micros(window_start))
        .bind(micros(stale_before))
        .bind(source)
        .fetch_one(&self.pool)
        .await?;

        let total = row.try_get::<i64, _>("total")? as u64;
        let completed = row.try_get::<i64, _>("completed")? as u64;
        let dead_lettered: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM failure_log WHERE source = ? AND failed_at >= ?")
                .bind(source)
                .bind(micros(window_start))
                .fetch_one(&self.pool)
                .await?;
        Ok(SourceStats {
            source: source.to_string(),
            total,
            completed,
            pending: total.saturating_sub(completed),
            claimed: row.try_get::<i64, _>("claimed")? as u64,
            enqueued_in_window: self.count_enqueued_since(source, window_start).await?,
            completed_in_window: row.try_get::<i64, _>("completed_in_window")? as u64,
            dead_lettered_in_window: dead_lettered as u64,
            top_failure_reasons: Vec::new(),
        })
    }

    async fn known_sources(&self) -> CoordResult<Vec<String>> {
        let sources: Vec<String> = sqlx::query_scalar("SELECT DISTINCT source FROM backlog_items ORDER BY source")
            .fetch_all(&self.pool)
            .await?;
        Ok(sources)
    }
}

#[async_trait]
impl QueueProvider for SqliteBackend {
    async fn pull(
        &self,
        topic: &str,
        max: usize,
        now: DateTime<Utc>,
        visible_until: DateTime<Utc>,
    ) -> CoordResult<Vec<QueueMessage>> {
        let candidates = sqlx::query(
            r#"
            SELECT id, message_id, payload, attributes, publish_time FROM queue_messages
            WHERE topic = ? AND (visible_at IS NULL OR visible_at <= ?)
            ORDER BY id
            LIMIT ?
            "#,
        )
        .bind(topic)
        .bind(micros(now))
        .bind(i64::try_from(max).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        let mut pulled = Vec::with_capacity(candidates.len());
        for row in &candidates {
            let id: i64 = row.try_get("id")?;
            let handle = AckHandle::new();

            // Another process may have taken the row since the select
            let taken = sqlx::query(
                r#"
                UPDATE queue_messages SET ack_handle = ?, visible_at = ?
                WHERE id = ? AND (visible_at IS NULL OR visible_at <= ?)
                "#,
            )
            .bind(handle.as_str())
            .bind(micros(visible_until))
            .bind(id)
            .bind(micros(now))
            .execute(&self.pool)
            .await?;
            if taken.rows_affected() == 0 {
                continue;
            }

            let attributes: String = row.try_get("attributes")?;
            pulled.push(QueueMessage {
                message_id: MessageId(row.try_get("message_id")?),
                payload: row.try_get("payload")?,
                attributes: serde_json::from_str::<Attributes>(&attributes)?,
                publish_time: from_micros(row.try_get("publish_time")?)?,
                ack_handle: handle,
                deadline: visible_until,
            });
        }
        Ok(pulled)
    }

    async fn ack(&self, topic: &str, handle: &AckHandle) -> CoordResult<()> {
        sqlx::query("DELETE FROM queue_messages WHERE topic = ? AND ack_handle = ?")
            .bind(topic)
            .bind(handle.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        attributes: Attributes,
        now: DateTime<Utc>,
    ) -> CoordResult<MessageId> {
        let message_id = MessageId::new();
        sqlx::query(
            r#"
            INSERT INTO queue_messages (message_id, topic, payload, attributes, publish_time)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(message_id.as_str())
        .bind(topic)
        .bind(payload)
        .bind(serde_json::to_string(&attributes)?)
        .bind(micros(now))
        .execute(&self.pool)
        .await?;
        Ok(message_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, SubsecRound};

    async fn backend() -> SqliteBackend {
        let backend = SqliteBackend::connect("sqlite::memory:").await.unwrap();
        backend.migrate().await.unwrap();
        backend
    }

    fn filter(now: DateTime<Utc>) -> ClaimFilter {
        ClaimFilter {
            partitions: vec!["UT".to_string()],
            stale_before: now - ChronoDuration::hours(5),
            enqueued_since: now - ChronoDuration::hours(1),
        }
    }

    #[tokio::test]
    async fn test_lock_rows_are_not_unique() {
        let store = backend().await;
        let now = Utc::now();
        let lock = |holder: &str, offset: i64| Lock {
            name: "zillow_job_loader".to_string(),
            holder_id: OwnerId::from(holder),
            acquired_at: now + ChronoDuration::microseconds(offset),
            expires_at: now + ChronoDuration::minutes(10),
        };

        assert!(store.insert_if_vacant(&lock("a", 0), now).await.unwrap());
        assert!(!store.insert_if_vacant(&lock("b", 1), now).await.unwrap());

        // A racing insert that skipped the vacancy check
        sqlx::query("INSERT INTO locks VALUES (?, ?, ?, ?)")
            .bind("zillow_job_loader")
            .bind("b")
            .bind(micros(now + ChronoDuration::microseconds(1)))
            .bind(micros(now + ChronoDuration::minutes(10)))
            .execute(store.pool())
            .await
            .unwrap();

        let valid = store.valid_locks("zillow_job_loader", now).await.unwrap();
        assert_eq!(valid.len(), 2);
        assert_eq!(valid[0].holder_id, OwnerId::from("a"));
    }

    #[tokio::test]
    async fn test_mark_claims_respects_partition_and_enqueue_log() {
        let store = backend().await;
        let now = Utc::now();
        store
            .insert_items(&[
                BacklogItem::new("zillow", "a", "UT"),
                BacklogItem::new("zillow", "b", "UT"),
                BacklogItem::new("zillow", "c", "NV"),
            ])
            .await
            .unwrap();
        store
            .record_enqueued(&[EnqueueLogEntry {
                key: "b".to_string(),
                source: "zillow".to_string(),
                enqueued_at: now,
                owner: OwnerId::from("r1"),
            }])
            .await
            .unwrap();

        let marker = ClaimMarker {
            owner: OwnerId::from("w1"),
            stamp: now,
        };
        let matched = store.mark_claims("zillow", &filter(now), &marker, 10).await.unwrap();
        let won = store.claimed_by("zillow", &marker).await.unwrap();

        assert_eq!(matched, 1);
        assert_eq!(won.len(), 1);
        assert_eq!(won[0].key, "a");
        assert_eq!(won[0].claim_timestamp, Some(now.trunc_subsecs(6)));
    }

    #[tokio::test]
    async fn test_pull_hides_message_until_deadline() {
        let store = backend().await;
        let now = Utc::now();
        let mut attributes = Attributes::new();
        attributes.insert("source".to_string(), "zillow".to_string());
        let id = store
            .publish("zillow-job-queue", b"{}".to_vec(), attributes.clone(), now)
            .await
            .unwrap();

        let deadline = now + ChronoDuration::minutes(30);
        let first = store.pull("zillow-job-queue", 10, now, deadline).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].message_id, id);
        assert_eq!(first[0].attributes, attributes);
        assert!(store.pull("zillow-job-queue", 10, now, deadline).await.unwrap().is_empty());

        let later = deadline + ChronoDuration::seconds(1);
        let second = store.pull("zillow-job-queue", 10, later, later).await.unwrap();
        assert_eq!(second.len(), 1);

        // The first handle is stale after redelivery
        store.ack("zillow-job-queue", &first[0].ack_handle).await.unwrap();
        store.ack("zillow-job-queue", &second[0].ack_handle).await.unwrap();
        assert!(store.pull("zillow-job-queue", 10, later, later).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_source_stats_counts() {
        let store = backend().await;
        let now = Utc::now();
        store
            .insert_items(&[BacklogItem::new("zillow", "a", "UT"), BacklogItem::new("zillow", "b", "UT")])
            .await
            .unwrap();
        store.mark_completed("zillow", "a", now).await.unwrap();
        assert!(!store.mark_completed("zillow", "a", now).await.unwrap());

        let stats = store
            .source_stats("zillow", now - ChronoDuration::hours(1), now - ChronoDuration::hours(5))
            .await
            .unwrap();
        assert_eq!((stats.total, stats.completed, stats.pending), (2, 1, 1));
        assert_eq!(stats.completed_in_window, 1);
        assert_eq!(store.known_sources().await.unwrap(), vec!["zillow".to_string()]);

        let keys = vec!["a".to_string(), "b".to_string(), "missing".to_string()];
        let completed = store.completed_keys("zillow", &keys).await.unwrap();
        assert_eq!(completed, HashSet::from(["a".to_string()]));
    }

    #[tokio::test]
    async fn test_failure_log_groups_reasons_and_purges() {
        let store = backend().await;
        let now = Utc::now();
        let failure = |key: Option<&str>, reason: &str, failed_at| FailureLogEntry {
            source: "zillow".to_string(),
            key: key.map(str::to_string),
            message_id: MessageId::new(),
            reason: reason.to_string(),
            failed_at,
        };
        for entry in [
            failure(Some("a"), "listing removed", now),
            failure(Some("b"), "listing removed", now),
            failure(None, "undecodable payload", now),
            failure(Some("c"), "captcha", now - ChronoDuration::hours(30)),
        ] {
            store.record_failure(&entry).await.unwrap();
        }

        let since = now - ChronoDuration::hours(24);
        let reasons = store.failure_reasons_since("zillow", since, 5).await.unwrap();
        assert_eq!(
            reasons,
            vec![
                FailureReason { reason: "listing removed".to_string(), count: 2 },
                FailureReason { reason: "undecodable payload".to_string(), count: 1 },
            ]
        );
        let stats = store.source_stats("zillow", since, now).await.unwrap();
        assert_eq!(stats.dead_lettered_in_window, 3);

        assert_eq!(store.purge_failure_log(Some("zillow"), since).await.unwrap(), 1);
        assert_eq!(store.failure_reasons_since("zillow", now - ChronoDuration::days(7), 5).await.unwrap().len(), 2);
    }
}
