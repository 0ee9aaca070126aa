//! # Configuration
//!
//! Configuration is a flat string key/value store. Keys are dotted
//! (`lock.ttl_secs`, `source.zillow.partitions`) and are usually loaded from
//! environment variables carrying the `BACKLOG__` prefix, with `__`
//! separating segments:
//!
//! ```bash
//! export BACKLOG__SOURCES=zillow,landwatch
//! export BACKLOG__SOURCE__ZILLOW__PARTITIONS=UT,NV
//! export BACKLOG__CLAIM__TTL_SECS=18000
//! ```
//!
//! [`CoordConfig::from_store`] turns the store into typed settings, falling
//! back to defaults for absent keys and rejecting unparsable values.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use crate::retry::{ExponentialBackoff, LinearBackoff, RetryPolicy};
use crate::{CoordError, CoordResult};

/// Environment prefix read by [`ConfigStore::from_env`]
pub const ENV_PREFIX: &str = "BACKLOG__";

/// Longest duration any setting may take
const MAX_DURATION: Duration = Duration::from_secs(10 * 365 * 24 * 3600);

#[derive(Debug, Clone, Default)]
pub struct ConfigStore {
    values: HashMap<String, String>,
}

impl ConfigStore {
    /// Create an empty config store.
    pub fn new() -> Self {
        Self {
            values: HashMap::new(),
        }
    }

    /// Load every `BACKLOG__*` environment variable.
    pub fn from_env() -> Self {
        Self::from_vars(std::env::vars(), ENV_PREFIX)
    }

    /// Load prefixed variables: `BACKLOG__LOCK__TTL_SECS` becomes `lock.ttl_secs`.
    pub fn from_vars<I>(vars: I, prefix: &str) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut store = Self::new();
        for (key, value) in vars {
            if let Some(stripped) = key.strip_prefix(prefix) {
                let normalized = stripped.to_lowercase().replace("__", ".");
                store.set(normalized, value);
            }
        }
        store
    }

    pub fn set<K, V>(&mut self, key: K, value: V)
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.values.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(|s| s.trim()).filter(|s| !s.is_empty())
    }

    pub fn has(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Parse a value, `Ok(None)` when absent
    pub fn get_parsed<T>(&self, key: &str) -> CoordResult<Option<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => raw
                .parse::<T>()
                .map(Some)
                .map_err(|e| CoordError::config(format!("{key}: cannot parse {raw:?}: {e}"))),
        }
    }

    /// Comma-separated list, empty when absent
    pub fn get_list(&self, key: &str) -> Vec<String> {
        self.get(key)
            .map(|raw| {
                raw.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn secs_or(&self, key: &str, default: Duration) -> CoordResult<Duration> {
        Ok(self.get_parsed::<u64>(key)?.map(Duration::from_secs).unwrap_or(default))
    }

    fn millis_or(&self, key: &str, default: Duration) -> CoordResult<Duration> {
        Ok(self.get_parsed::<u64>(key)?.map(Duration::from_millis).unwrap_or(default))
    }
}

/// Per-source routing: backlog partitions, work topic and dead-letter topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceConfig {
    pub name: String,
    /// Partitions the replenisher draws from; empty means all of them
    pub partitions: Vec<String>,
    pub topic: String,
    /// `None` disables dead-letter publishing; failed messages are only acked
    pub dead_letter_topic: Option<String>,
}

impl SourceConfig {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            topic: format!("{name}-job-queue"),
            dead_letter_topic: Some(format!("{name}-dlq")),
            partitions: Vec::new(),
            name,
        }
    }

    pub fn with_partitions<I, S>(mut self, partitions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.partitions = partitions.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = topic.into();
        self
    }

    pub fn with_dead_letter_topic(mut self, topic: Option<String>) -> Self {
        self.dead_letter_topic = topic;
        self
    }

    /// Name of the lease lock guarding this source's replenishment
    pub fn lock_name(&self) -> String {
        format!("{}_job_loader", self.name)
    }

    fn from_store(store: &ConfigStore, name: &str) -> Self {
        let prefix = format!("source.{}", name.to_lowercase());
        let mut source = Self::new(name).with_partitions(store.get_list(&format!("{prefix}.partitions")));

        if let Some(topic) = store.get(&format!("{prefix}.topic")) {
            source.topic = topic.to_string();
        }
        if let Some(dlq) = store.get(&format!("{prefix}.dead_letter_topic")) {
            source.dead_letter_topic = match dlq {
                "none" | "off" | "disabled" => None,
                topic => Some(topic.to_string()),
            };
        }
        source
    }
}

/// Typed coordination settings
#[derive(Debug, Clone)]
pub struct CoordConfig {
    pub database_url: String,
    /// TTL of the replenishment lease lock
    pub lock_ttl: Duration,
    /// How long a claim marker is honoured
    pub claim_ttl: Duration,
    /// Sleep between the claim update and the verifying read
    pub claim_safety_interval: Duration,
    /// Recent-enqueue and recent-completion window
    pub dedup_window: Duration,
    pub enqueue_log_retention: Duration,
    /// Visibility deadline of pulled messages
    pub ack_deadline: Duration,
    pub replenish_batch_size: usize,
    pub replenish_max_attempts: u32,
    pub replenish_backoff: ExponentialBackoff,
    pub worker_max_empty_attempts: u32,
    pub worker_batch_size: usize,
    pub worker_empty_backoff: LinearBackoff,
    pub store_retry: RetryPolicy,
    pub processor_command: Option<String>,
    pub sources: Vec<SourceConfig>,
}

impl Default for CoordConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://backlog.db".to_string(),
            lock_ttl: Duration::from_secs(10 * 60),
            claim_ttl: Duration::from_secs(5 * 3600),
            claim_safety_interval: Duration::from_secs(5),
            dedup_window: Duration::from_secs(3600),
            enqueue_log_retention: Duration::from_secs(30 * 24 * 3600),
            ack_deadline: Duration::from_secs(30 * 60),
            replenish_batch_size: 5000,
            replenish_max_attempts: 3,
            replenish_backoff: ExponentialBackoff::default(),
            worker_max_empty_attempts: 5,
            worker_batch_size: 10,
            worker_empty_backoff: LinearBackoff::default(),
            store_retry: RetryPolicy::default(),
            processor_command: None,
            sources: Vec::new(),
        }
    }
}

impl CoordConfig {
    /// Defaults overlaid with `BACKLOG__*` environment variables
    pub fn from_env() -> CoordResult<Self> {
        Self::from_store(&ConfigStore::from_env())
    }

    pub fn from_store(store: &ConfigStore) -> CoordResult<Self> {
        let defaults = Self::default();

        let store_retry = RetryPolicy::new(
            store
                .get_parsed("store.retry_attempts")?
                .unwrap_or(defaults.store_retry.max_attempts),
            ExponentialBackoff::new(
                store.millis_or("store.retry_base_ms", defaults.store_retry.backoff.base)?,
                defaults.store_retry.backoff.cap,
            ),
        );

        let config = Self {
            database_url: store
                .get("database.url")
                .map(str::to_string)
                .unwrap_or(defaults.database_url),
            lock_ttl: store.secs_or("lock.ttl_secs", defaults.lock_ttl)?,
            claim_ttl: store.secs_or("claim.ttl_secs", defaults.claim_ttl)?,
            claim_safety_interval: store
                .millis_or("claim.safety_interval_ms", defaults.claim_safety_interval)?,
            dedup_window: store.secs_or("dedup.window_secs", defaults.dedup_window)?,
            enqueue_log_retention: store
                .secs_or("dedup.retention_secs", defaults.enqueue_log_retention)?,
            ack_deadline: store.secs_or("queue.ack_deadline_secs", defaults.ack_deadline)?,
            replenish_batch_size: store
                .get_parsed("replenish.batch_size")?
                .unwrap_or(defaults.replenish_batch_size),
            replenish_max_attempts: store
                .get_parsed("replenish.max_attempts")?
                .unwrap_or(defaults.replenish_max_attempts),
            replenish_backoff: ExponentialBackoff::new(
                store.millis_or("replenish.backoff_base_ms", defaults.replenish_backoff.base)?,
                store.millis_or("replenish.backoff_cap_ms", defaults.replenish_backoff.cap)?,
            ),
            worker_max_empty_attempts: store
                .get_parsed("worker.max_empty_attempts")?
                .unwrap_or(defaults.worker_max_empty_attempts),
            worker_batch_size: store
                .get_parsed("worker.batch_size")?
                .unwrap_or(defaults.worker_batch_size),
            worker_empty_backoff: LinearBackoff::new(
                store.millis_or("worker.empty_backoff_step_ms", defaults.worker_empty_backoff.step)?,
                store.millis_or("worker.empty_backoff_cap_ms", defaults.worker_empty_backoff.cap)?,
            ),
            store_retry,
            processor_command: store.get("processor.command").map(str::to_string),
            sources: store
                .get_list("sources")
                .iter()
                .map(|name| SourceConfig::from_store(store, name))
                .collect(),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn with_source(mut self, source: SourceConfig) -> Self {
        self.sources.retain(|s| s.name != source.name);
        self.sources.push(source);
        self
    }

    /// Look up a configured source by name
    pub fn source(&self, name: &str) -> CoordResult<&SourceConfig> {
        self.sources
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| CoordError::UnknownSource(name.to_string()))
    }

    /// Reject settings that would make the coordination protocol meaningless
    pub fn validate(&self) -> CoordResult<()> {
        let durations = [
            ("lock.ttl_secs", self.lock_ttl),
            ("claim.ttl_secs", self.claim_ttl),
            ("dedup.window_secs", self.dedup_window),
            ("dedup.retention_secs", self.enqueue_log_retention),
            ("queue.ack_deadline_secs", self.ack_deadline),
        ];
        for (key, value) in durations {
            if value.is_zero() {
                return Err(CoordError::config(format!("{key} must be greater than zero")));
            }
            if value > MAX_DURATION {
                return Err(CoordError::config(format!("{key} is out of range")));
            }
        }
        if self.claim_safety_interval >= self.claim_ttl {
            return Err(CoordError::config(
                "claim.safety_interval_ms must be shorter than claim.ttl_secs",
            ));
        }
        if self.enqueue_log_retention < self.dedup_window {
            return Err(CoordError::config(
                "dedup.retention_secs must cover dedup.window_secs",
            ));
        }
        if self.worker_batch_size == 0 {
            return Err(CoordError::config("worker.batch_size must be at least 1"));
        }
        if self.replenish_batch_size == 0 {
            return Err(CoordError::config("replenish.batch_size must be at least 1"));
        }
        if self.replenish_backoff.base > self.replenish_backoff.cap {
            return Err(CoordError::config(
                "replenish.backoff_base_ms must not exceed replenish.backoff_cap_ms",
            ));
        }
        for source in &self.sources {
            if source.topic.is_empty() {
                return Err(CoordError::config(format!("source {} has an empty topic", source.name)));
            }
            if source.dead_letter_topic.as_deref() == Some(source.topic.as_str()) {
                return Err(CoordError::config(format!(
                    "source {} dead-letters into its own work topic",
                    source.name
                )));
            }
        }
        Ok(())
    }
}
