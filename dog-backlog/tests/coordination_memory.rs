use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use proptest::prelude::*;
use tokio_test::assert_ok;

use dog_backlog::backend::memory::MemoryBackend;
use dog_backlog::prelude::*;
use dog_backlog::{
    Attributes, BacklogItem, BacklogStore, ClaimMarker, ClaimProtocol, Clock, DeadLetterOutcome, DeadLetterRecord,
    ExponentialBackoff, LeaseLock, LinearBackoff, ManualClock, OwnerId, QueueProvider, RetryPolicy, WorkPayload,
    WorkQueue, WorkerSettings, WorkerState,
};

const SOURCE: &str = "zillow";
const TOPIC: &str = "zillow-job-queue";
const DLQ: &str = "zillow-dlq";

/// Test factory functions
fn create_test_source() -> SourceConfig {
    SourceConfig::new(SOURCE).with_partitions(["UT"])
}

fn create_test_context(backend: &MemoryBackend, clock: Arc<ManualClock>) -> CoordCtx {
    let config = CoordConfig {
        store_retry: RetryPolicy::none(),
        ..CoordConfig::default()
    }
    .with_source(create_test_source());
    CoordCtx::new(backend.stores(), config).with_clock(clock)
}

fn create_test_clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(Utc::now()))
}

async fn seed_backlog(backend: &MemoryBackend, keys: &[&str]) {
    let items: Vec<BacklogItem> = keys.iter().map(|key| BacklogItem::new(SOURCE, *key, "UT")).collect();
    backend.backlog.insert_items(&items).await.unwrap();
}

async fn seed_numbered(backend: &MemoryBackend, count: usize) {
    let items: Vec<BacklogItem> = (0..count)
        .map(|i| BacklogItem::new(SOURCE, format!("listing-{i}"), "UT"))
        .collect();
    backend.backlog.insert_items(&items).await.unwrap();
}

fn dead_letters(backend: &MemoryBackend) -> Vec<DeadLetterRecord> {
    backend
        .queue
        .messages(DLQ)
        .iter()
        .map(|m| serde_json::from_slice(&m.payload).unwrap())
        .collect()
}

fn test_settings(max_empty_attempts: u32) -> WorkerSettings {
    WorkerSettings {
        batch_size: 10,
        max_empty_attempts,
        empty_backoff: LinearBackoff::new(Duration::from_secs(10), Duration::from_secs(30)),
        replenish_attempts: 1,
    }
}

/// Succeeds `ok-*`, fails `bad-*`, reports nothing for any other key
struct ListingProcessor;

#[async_trait]
impl ItemProcessor for ListingProcessor {
    async fn process_batch(&self, items: &[WorkItem]) -> Result<BatchOutcome, ProcessError> {
        let mut outcome = BatchOutcome::new();
        for item in items {
            if item.key.starts_with("ok-") {
                outcome.succeed(&item.key);
            } else if item.key.starts_with("bad-") {
                outcome.fail(&item.key, ProcessError::permanent("listing removed"));
            }
        }
        Ok(outcome)
    }
}

struct CrashingProcessor;

#[async_trait]
impl ItemProcessor for CrashingProcessor {
    async fn process_batch(&self, _items: &[WorkItem]) -> Result<BatchOutcome, ProcessError> {
        Err(ProcessError::batch_fatal("browser crashed"))
    }
}

/// Succeeds every item and counts the items it was handed
#[derive(Default)]
struct CountingProcessor {
    seen: AtomicUsize,
}

#[async_trait]
impl ItemProcessor for CountingProcessor {
    async fn process_batch(&self, items: &[WorkItem]) -> Result<BatchOutcome, ProcessError> {
        self.seen.fetch_add(items.len(), Ordering::SeqCst);
        Ok(BatchOutcome::all_succeeded(items))
    }
}

/// A1. Lease Lock Is Exclusive While Valid
#[tokio::test]
async fn test_lease_lock_is_exclusive_while_valid() {
    let backend = MemoryBackend::new();
    let ctx = create_test_context(&backend, create_test_clock());
    let first = LeaseLock::new(&ctx, OwnerId::from("replenisher-a"));
    let second = LeaseLock::new(&ctx, OwnerId::from("replenisher-b"));
    let ttl = Duration::from_secs(600);

    // Act: both try to take the same lock
    let acquired = assert_ok!(first.acquire("zillow_job_loader", ttl).await);
    let contended = assert_ok!(second.acquire("zillow_job_loader", ttl).await);

    // Assert: only the first holds it
    assert!(acquired);
    assert!(!contended);

    // Release hands the lock over
    assert!(first.release("zillow_job_loader", first.holder()).await.unwrap());
    assert!(second.acquire("zillow_job_loader", ttl).await.unwrap());
}

/// A2. Expired Lock Can Be Taken Over
#[tokio::test]
async fn test_expired_lock_can_be_taken_over() {
    let backend = MemoryBackend::new();
    let clock = create_test_clock();
    let ctx = create_test_context(&backend, clock.clone());
    let crashed = LeaseLock::new(&ctx, OwnerId::from("replenisher-a"));
    let successor = LeaseLock::new(&ctx, OwnerId::from("replenisher-b"));

    // Arrange: holder takes the lock and never releases it
    assert!(crashed.acquire("zillow_job_loader", Duration::from_secs(600)).await.unwrap());

    // Act: move past the TTL
    clock.advance(chrono::Duration::seconds(601));
    let acquired = successor.acquire("zillow_job_loader", Duration::from_secs(600)).await.unwrap();

    // Assert: the expired row was collected and replaced
    assert!(acquired);
    let rows = backend.locks.rows();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].holder_id, OwnerId::from("replenisher-b"));
}

/// B1. Concurrent Claims Are Disjoint
#[tokio::test(start_paused = true)]
async fn test_concurrent_claims_are_disjoint() {
    let backend = MemoryBackend::new();
    let ctx = create_test_context(&backend, create_test_clock());
    seed_numbered(&backend, 1000).await;
    let w1 = ClaimProtocol::new(&ctx, SOURCE);
    let w2 = ClaimProtocol::new(&ctx, SOURCE);
    let (o1, o2) = (OwnerId::from("w1"), OwnerId::from("w2"));

    // Act: two workers claim from the same partition at once
    let (b1, b2) = tokio::join!(w1.claim_batch("UT", 50, &o1), w2.claim_batch("UT", 50, &o2));
    let (b1, b2) = (b1.unwrap(), b2.unwrap());

    // Assert: no key is won twice and neither exceeds its batch
    let k1: HashSet<String> = b1.keys().into_iter().collect();
    let k2: HashSet<String> = b2.keys().into_iter().collect();
    assert!(k1.is_disjoint(&k2));
    assert!(b1.won.len() as u64 <= b1.matched && b1.matched <= 50);
    assert!(b2.won.len() as u64 <= b2.matched && b2.matched <= 50);
    assert!(k1.len() + k2.len() <= 100);
}

/// B2. Overwritten Claims Are Ceded
#[tokio::test(start_paused = true)]
async fn test_overwritten_claims_are_ceded() {
    let backend = MemoryBackend::new();
    let clock = create_test_clock();
    let ctx = create_test_context(&backend, clock.clone());
    seed_numbered(&backend, 200).await;
    let claims = Arc::new(ClaimProtocol::new(&ctx, SOURCE));
    let w1 = OwnerId::from("w1");

    // Arrange: start a claim and wait for its update to land
    let task = tokio::spawn({
        let claims = claims.clone();
        let w1 = w1.clone();
        async move { claims.claim_batch("UT", 50, &w1).await }
    });
    let marked = loop {
        let keys = backend.backlog.keys_claimed_by(SOURCE, &w1);
        if !keys.is_empty() {
            break keys;
        }
        tokio::task::yield_now().await;
    };

    // Act: a competing claimant overwrites ten rows during the safety interval
    let rival = ClaimMarker {
        owner: OwnerId::from("w2"),
        stamp: clock.now(),
    };
    let overwritten: HashSet<String> = marked.iter().take(10).cloned().collect();
    for key in &overwritten {
        backend.backlog.force_claim(SOURCE, key, &rival);
    }
    let batch = task.await.unwrap().unwrap();

    // Assert: the verifying read drops the overwritten rows
    assert_eq!(batch.matched, 50);
    assert_eq!(batch.won.len(), 40);
    assert_eq!(batch.ceded(), 10);
    assert!(batch.keys().iter().all(|key| !overwritten.contains(key)));
}

/// B3. Abandoned Claims Expire After The TTL
#[tokio::test(start_paused = true)]
async fn test_abandoned_claims_expire() {
    let backend = MemoryBackend::new();
    let clock = create_test_clock();
    let ctx = create_test_context(&backend, clock.clone());
    seed_numbered(&backend, 10).await;
    let crashed = ClaimProtocol::new(&ctx, SOURCE);
    let successor = ClaimProtocol::new(&ctx, SOURCE);

    // Arrange: a worker claims everything and dies
    let first = crashed.claim_batch("UT", 10, &OwnerId::from("w1")).await.unwrap();
    assert_eq!(first.won.len(), 10);

    // Nothing is claimable while the claim is live
    let blocked = successor.claim_batch("UT", 10, &OwnerId::from("w2")).await.unwrap();
    assert_eq!(blocked.matched, 0);

    // Act: move past the claim TTL
    clock.advance(chrono::Duration::hours(5) + chrono::Duration::seconds(1));
    let recovered = successor.claim_batch("UT", 10, &OwnerId::from("w2")).await.unwrap();

    // Assert: every item is recovered
    assert_eq!(recovered.won.len(), 10);
}

/// C1. Ack Is Idempotent
#[tokio::test]
async fn test_ack_is_idempotent() {
    let backend = MemoryBackend::new();
    let ctx = create_test_context(&backend, create_test_clock());
    let queue = WorkQueue::new(&ctx, &create_test_source());
    queue
        .publish(&WorkPayload {
            source: SOURCE.to_string(),
            key: "listing-1".to_string(),
            partition: "UT".to_string(),
            enqueued_at: Utc::now(),
        })
        .await
        .unwrap();

    // Act: ack the same delivery twice
    let message = queue.pull_batch(1).await.unwrap().remove(0);
    let first = queue.ack(&message.ack_handle).await;
    let second = queue.ack(&message.ack_handle).await;

    // Assert: both succeed and the message is gone
    assert!(first && second);
    assert_eq!(backend.queue.depth(TOPIC), 0);
}

/// C2. Dead-Letter Record Carries The Original Message
#[tokio::test]
async fn test_dead_letter_record_is_complete() {
    let backend = MemoryBackend::new();
    let ctx = create_test_context(&backend, create_test_clock());
    let queue = WorkQueue::new(&ctx, &create_test_source());
    let mut attributes = Attributes::new();
    attributes.insert("source".to_string(), SOURCE.to_string());
    attributes.insert("trace".to_string(), "abc123".to_string());
    backend
        .queue
        .publish(TOPIC, b"{\"raw\":true}".to_vec(), attributes.clone(), Utc::now())
        .await
        .unwrap();

    // Act
    let message = queue.pull_batch(1).await.unwrap().remove(0);
    let outcome = queue.dead_letter(&message, "listing removed").await;

    // Assert: record published with every original field, original acked
    assert_eq!(outcome, DeadLetterOutcome { published: true, acked: true });
    assert_eq!(backend.queue.depth(TOPIC), 0);

    let published = backend.queue.messages(DLQ);
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].attributes, attributes);

    let record: DeadLetterRecord = serde_json::from_slice(&published[0].payload).unwrap();
    assert_eq!(record.original_data, "{\"raw\":true}");
    assert_eq!(record.original_attributes, attributes);
    assert_eq!(record.original_message_id, message.message_id);
    assert_eq!(record.original_publish_time, message.publish_time);
    assert_eq!(record.error_reason, "listing removed");
    assert_eq!(record.dlq_source, "processing_error");
}

/// C3. Dead-Letter Publish Failure Still Acks
#[tokio::test]
async fn test_dead_letter_publish_failure_still_acks() {
    let backend = MemoryBackend::new();
    let ctx = create_test_context(&backend, create_test_clock());
    let queue = WorkQueue::new(&ctx, &create_test_source());
    backend
        .queue
        .publish(TOPIC, b"{}".to_vec(), Attributes::new(), Utc::now())
        .await
        .unwrap();
    backend.queue.make_unavailable(DLQ);

    // Act
    let message = queue.pull_batch(1).await.unwrap().remove(0);
    let outcome = queue.dead_letter(&message, "listing removed").await;

    // Assert: the message is dropped, and the drop is visible in metrics
    assert_eq!(outcome, DeadLetterOutcome { published: false, acked: true });
    assert_eq!(backend.queue.depth(TOPIC), 0);
    assert_eq!(backend.queue.depth(DLQ), 0);
    let metrics = ctx.observability.metrics().snapshot();
    assert_eq!(metrics.items_dead_lettered, 1);
    assert_eq!(metrics.dead_letter_publish_failures, 1);
}

/// D1. Replenisher Does Not Re-Enqueue Recent Work
#[tokio::test(start_paused = true)]
async fn test_replenisher_dedups_recent_enqueues() {
    let backend = MemoryBackend::new();
    let clock = create_test_clock();
    let ctx = create_test_context(&backend, clock.clone());
    seed_numbered(&backend, 20).await;
    let replenisher = JobReplenisher::new(&ctx, create_test_source());

    // Arrange: first replenishment enqueues everything
    let first = replenisher.replenish_if_needed(100).await.unwrap();
    assert_eq!(first, ReplenishOutcome::Enqueued(20));

    // Drop the claims so only the enqueue log stands in the way
    backend.backlog.release_stale_claims(Some(SOURCE), clock.now()).await.unwrap();

    // Act
    let second = replenisher.replenish_if_needed(100).await.unwrap();

    // Assert: nothing new, no duplicate keys on the topic
    assert_eq!(second, ReplenishOutcome::NothingQueueable);
    let keys: Vec<String> = backend
        .queue
        .messages(TOPIC)
        .iter()
        .map(|m| serde_json::from_slice::<WorkPayload>(&m.payload).unwrap().key)
        .collect();
    let unique: HashSet<&String> = keys.iter().collect();
    assert_eq!(keys.len(), 20);
    assert_eq!(unique.len(), 20);

    // Lock was released on the way out
    assert!(backend.locks.rows().is_empty());
}

/// D1b. Claims Skip Keys In The Recent Enqueue Log
#[tokio::test(start_paused = true)]
async fn test_replenisher_claims_skip_recently_enqueued_keys() {
    let backend = MemoryBackend::new();
    let clock = create_test_clock();
    let ctx = create_test_context(&backend, clock.clone());
    seed_numbered(&backend, 40).await;
    let replenisher = JobReplenisher::new(&ctx, create_test_source());

    // Arrange: enqueue half the backlog, then drop every claim
    assert_eq!(replenisher.replenish_if_needed(20).await.unwrap(), ReplenishOutcome::Enqueued(20));
    let first: HashSet<String> = backend.backlog.enqueue_log().into_iter().map(|e| e.key).collect();
    backend.backlog.release_stale_claims(Some(SOURCE), clock.now()).await.unwrap();

    // Act: the claim step must pass over the 20 logged keys
    let second = replenisher.replenish_if_needed(100).await.unwrap();

    // Assert: exactly the other half was published, nothing twice
    assert_eq!(second, ReplenishOutcome::Enqueued(20));
    let keys: Vec<String> = backend
        .queue
        .messages(TOPIC)
        .iter()
        .map(|m| serde_json::from_slice::<WorkPayload>(&m.payload).unwrap().key)
        .collect();
    let unique: HashSet<&String> = keys.iter().collect();
    assert_eq!(keys.len(), 40);
    assert_eq!(unique.len(), 40);

    let all: HashSet<String> = backend.backlog.enqueue_log().into_iter().map(|e| e.key).collect();
    let later: HashSet<&String> = all.difference(&first).collect();
    assert_eq!(later.len(), 20);
}

/// D2. Replenisher Honours The Batch Size
#[tokio::test(start_paused = true)]
async fn test_replenisher_honours_batch_size() {
    let backend = MemoryBackend::new();
    let ctx = create_test_context(&backend, create_test_clock());
    seed_numbered(&backend, 30).await;
    let replenisher = JobReplenisher::new(&ctx, create_test_source());

    let outcome = replenisher.replenish_if_needed(12).await.unwrap();

    assert_eq!(outcome, ReplenishOutcome::Enqueued(12));
    assert_eq!(backend.queue.depth(TOPIC), 12);
    // 18 unclaimed rows less the 12 logged as recently enqueued
    assert_eq!(replenisher.estimate_queueable().await.unwrap(), 6);
}

/// D3. Held Lock Means Lock Unavailable
#[tokio::test]
async fn test_replenisher_reports_lock_unavailable() {
    let backend = MemoryBackend::new();
    let ctx = create_test_context(&backend, create_test_clock());
    seed_numbered(&backend, 5).await;
    let source = create_test_source();
    let other = LeaseLock::new(&ctx, OwnerId::from("replenisher-other"));
    assert!(other.acquire(&source.lock_name(), Duration::from_secs(600)).await.unwrap());

    let replenisher = JobReplenisher::new(&ctx, source);
    let outcome = replenisher.replenish_if_needed(100).await.unwrap();

    assert_eq!(outcome, ReplenishOutcome::LockUnavailable);
    assert!(!outcome.replenished());
    assert_eq!(backend.queue.depth(TOPIC), 0);
}

/// D4. Retry With Backoff Sleeps Between Attempts Only
#[tokio::test(start_paused = true)]
async fn test_retry_with_backoff_waits_exponentially() {
    let backend = MemoryBackend::new();
    let ctx = create_test_context(&backend, create_test_clock());
    let replenisher = JobReplenisher::new(&ctx, create_test_source());

    let started = tokio::time::Instant::now();
    let replenished = replenisher.retry_with_backoff(3).await;

    // 1s after the first attempt, 2s after the second, none after the last
    assert!(!replenished);
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(3));
    assert!(elapsed < Duration::from_secs(4));
}

proptest! {
    /// D5. Exponential Backoff Is Monotone And Capped
    #[test]
    fn test_exponential_backoff_is_monotone(base_ms in 1u64..5_000, cap_ms in 1u64..120_000, attempt in 0u32..64) {
        let backoff = ExponentialBackoff::new(Duration::from_millis(base_ms), Duration::from_millis(cap_ms));

        prop_assert!(backoff.delay(attempt) <= backoff.delay(attempt + 1));
        prop_assert!(backoff.delay(attempt) <= Duration::from_millis(cap_ms));
    }
}

/// E1. Worker Completes, Dead-Letters And Exits When Drained
#[tokio::test(start_paused = true)]
async fn test_worker_processes_backlog_to_completion() {
    let backend = MemoryBackend::new();
    let ctx = create_test_context(&backend, create_test_clock());
    seed_backlog(&backend, &["ok-1", "ok-2", "ok-3", "bad-1", "skip-1"]).await;

    // Act
    let worker = WorkerLoop::new(&ctx, create_test_source(), Arc::new(ListingProcessor)).with_settings(test_settings(2));
    let summary = worker.run().await.unwrap();

    // Assert: counts
    assert_eq!(summary.processed, 5);
    assert_eq!(summary.succeeded, 3);
    assert_eq!(summary.dead_lettered, 2);
    assert_eq!(summary.replenishments, 1);
    assert_eq!(summary.dead_letter_publish_failures, 0);

    // Completion markers only on successes
    for item in backend.backlog.items(SOURCE) {
        assert_eq!(item.is_completed(), item.key.starts_with("ok-"), "{}", item.key);
    }

    // Every failure reached the dead-letter topic with its reason
    let reasons: HashSet<String> = dead_letters(&backend).into_iter().map(|r| r.error_reason).collect();
    let expected: HashSet<String> = ["listing removed", "no outcome reported"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    assert_eq!(reasons, expected);
    assert_eq!(backend.queue.depth(TOPIC), 0);
}

/// E2. Batch-Fatal Error Dead-Letters The Whole Batch
#[tokio::test(start_paused = true)]
async fn test_batch_fatal_error_dead_letters_every_item() {
    let backend = MemoryBackend::new();
    let ctx = create_test_context(&backend, create_test_clock());
    seed_numbered(&backend, 3).await;

    let worker = WorkerLoop::new(&ctx, create_test_source(), Arc::new(CrashingProcessor)).with_settings(test_settings(1));
    let summary = worker.run().await.unwrap();

    assert_eq!(summary.processed, 3);
    assert_eq!(summary.succeeded, 0);
    assert_eq!(summary.dead_lettered, 3);
    let records = dead_letters(&backend);
    assert_eq!(records.len(), 3);
    assert!(records
        .iter()
        .all(|r| r.error_reason == "batch failed before item outcomes were known: browser crashed"));
    assert!(backend.backlog.items(SOURCE).iter().all(|item| !item.is_completed()));
}

/// E3. Undecodable Message Is Dead-Lettered
#[tokio::test(start_paused = true)]
async fn test_undecodable_message_is_dead_lettered() {
    let backend = MemoryBackend::new();
    let ctx = create_test_context(&backend, create_test_clock());
    backend
        .queue
        .publish(TOPIC, b"not json".to_vec(), Attributes::new(), Utc::now())
        .await
        .unwrap();

    let worker = WorkerLoop::new(&ctx, create_test_source(), Arc::new(ListingProcessor)).with_settings(test_settings(1));
    let summary = worker.run().await.unwrap();

    assert_eq!(summary.processed, 1);
    assert_eq!(summary.dead_lettered, 1);
    let records = dead_letters(&backend);
    assert_eq!(records.len(), 1);
    assert!(records[0].error_reason.starts_with("undecodable payload"));
    assert_eq!(records[0].original_data, "not json");
}

/// E4. Worker Backs Off Linearly Then Exits On An Empty Backlog
#[tokio::test(start_paused = true)]
async fn test_worker_exits_after_max_empty_attempts() {
    let backend = MemoryBackend::new();
    let ctx = create_test_context(&backend, create_test_clock());

    let started = tokio::time::Instant::now();
    let worker = WorkerLoop::new(&ctx, create_test_source(), Arc::new(ListingProcessor)).with_settings(test_settings(3));
    let summary = worker.run().await.unwrap();

    // 10s after the first empty pull, 20s after the second, exit on the third
    assert_eq!(summary.empty_pulls, 3);
    assert_eq!(summary.batches, 0);
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(30));
    assert!(elapsed < Duration::from_secs(31));
}

/// E5. Shutdown Is Honoured While Backing Off
#[tokio::test(start_paused = true)]
async fn test_worker_shutdown_interrupts_backoff() {
    let backend = MemoryBackend::new();
    let ctx = create_test_context(&backend, create_test_clock());
    let worker = WorkerLoop::new(&ctx, create_test_source(), Arc::new(ListingProcessor)).with_settings(test_settings(100));

    // Arrange: let the worker find the queue empty and start backing off
    let handle = worker.spawn();
    tokio::time::sleep(Duration::from_secs(15)).await;
    assert_ne!(handle.state(), WorkerState::Stopped);

    // Act
    let summary = tokio::time::timeout(Duration::from_secs(1), handle.shutdown())
        .await
        .expect("worker did not stop")
        .unwrap();

    // Assert
    assert!(summary.empty_pulls >= 1);
    assert_eq!(summary.processed, 0);
}

/// E6. Redelivered Completed Item Is Acked Without Processing
#[tokio::test(start_paused = true)]
async fn test_completed_item_is_not_processed_again() {
    let backend = MemoryBackend::new();
    let clock = create_test_clock();
    let ctx = create_test_context(&backend, clock.clone());
    seed_backlog(&backend, &["listing-1", "listing-2"]).await;
    backend.backlog.mark_completed(SOURCE, "listing-1", clock.now()).await.unwrap();

    // Arrange: a late redelivery of finished work next to fresh work
    let queue = WorkQueue::new(&ctx, &create_test_source());
    for key in ["listing-1", "listing-2"] {
        queue
            .publish(&WorkPayload {
                source: SOURCE.to_string(),
                key: key.to_string(),
                partition: "UT".to_string(),
                enqueued_at: clock.now(),
            })
            .await
            .unwrap();
    }

    // Act
    let processor = Arc::new(CountingProcessor::default());
    let worker = WorkerLoop::new(&ctx, create_test_source(), processor.clone()).with_settings(test_settings(1));
    let summary = worker.run().await.unwrap();

    // Assert: only the fresh key reached the processor
    assert_eq!(processor.seen.load(Ordering::SeqCst), 1);
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.processed, 1);
    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.dead_lettered, 0);
    assert_eq!(backend.queue.depth(TOPIC), 0);
    assert!(dead_letters(&backend).is_empty());
}

/// E7. Only Completed Redeliveries Means No Processor Call
#[tokio::test(start_paused = true)]
async fn test_all_completed_batch_skips_processor() {
    let backend = MemoryBackend::new();
    let clock = create_test_clock();
    let ctx = create_test_context(&backend, clock.clone());
    seed_backlog(&backend, &["listing-1"]).await;
    backend.backlog.mark_completed(SOURCE, "listing-1", clock.now()).await.unwrap();
    WorkQueue::new(&ctx, &create_test_source())
        .publish(&WorkPayload {
            source: SOURCE.to_string(),
            key: "listing-1".to_string(),
            partition: "UT".to_string(),
            enqueued_at: clock.now(),
        })
        .await
        .unwrap();

    let processor = Arc::new(CountingProcessor::default());
    let worker = WorkerLoop::new(&ctx, create_test_source(), processor.clone()).with_settings(test_settings(1));
    let summary = worker.run().await.unwrap();

    assert_eq!(processor.seen.load(Ordering::SeqCst), 0);
    assert_eq!((summary.skipped, summary.succeeded, summary.processed), (1, 0, 0));
    assert_eq!(backend.queue.depth(TOPIC), 0);
}

/// F1. Stats, Clean And Reset
#[tokio::test]
async fn test_monitor_stats_clean_reset() {
    let backend = MemoryBackend::new();
    let clock = create_test_clock();
    let ctx = create_test_context(&backend, clock.clone());
    let monitor = Monitor::new(&ctx);
    seed_numbered(&backend, 5).await;
    backend.backlog.mark_completed(SOURCE, "listing-0", clock.now()).await.unwrap();
    backend.backlog.mark_completed(SOURCE, "listing-1", clock.now()).await.unwrap();
    let marker = ClaimMarker {
        owner: OwnerId::from("w1"),
        stamp: clock.now(),
    };
    backend.backlog.force_claim(SOURCE, "listing-2", &marker);
    let lock = LeaseLock::new(&ctx, OwnerId::from("replenisher-a"));
    assert!(lock.acquire("zillow_job_loader", Duration::from_secs(600)).await.unwrap());

    // Three dead-lettered deliveries, two sharing a reason
    let queue = WorkQueue::new(&ctx, &create_test_source());
    for key in ["listing-3", "listing-4", "listing-4"] {
        queue
            .publish(&WorkPayload {
                source: SOURCE.to_string(),
                key: key.to_string(),
                partition: "UT".to_string(),
                enqueued_at: clock.now(),
            })
            .await
            .unwrap();
    }
    for (message, reason) in queue
        .pull_batch(10)
        .await
        .unwrap()
        .iter()
        .zip(["listing removed", "captcha", "listing removed"])
    {
        queue.dead_letter(message, reason).await;
    }

    // Stats
    let report = monitor.stats(None, 1).await.unwrap();
    assert_eq!(report.sources.len(), 1);
    let stats = &report.sources[0];
    assert_eq!((stats.total, stats.completed, stats.pending, stats.claimed), (5, 2, 3, 1));
    assert_eq!(stats.completed_in_window, 2);
    assert_eq!(stats.dead_lettered_in_window, 3);
    let reasons: Vec<(&str, u64)> = stats
        .top_failure_reasons
        .iter()
        .map(|r| (r.reason.as_str(), r.count))
        .collect();
    assert_eq!(reasons, vec![("listing removed", 2), ("captcha", 1)]);
    assert_eq!(report.active_locks.len(), 1);
    let text = report.to_string();
    assert!(text.contains("zillow: 2/5 complete"));
    assert!(text.contains("3 dead-lettered (3.0/h)"));
    assert!(text.contains("2x listing removed"));

    // Reset releases the recent claim
    let reset = monitor.reset(Some(SOURCE), 1).await.unwrap();
    assert_eq!(reset.released_claims, 1);
    assert!(backend.backlog.keys_claimed_by(SOURCE, &OwnerId::from("w1")).is_empty());

    // Clean collects the lock once expired and any claim past the TTL
    backend.backlog.force_claim(SOURCE, "listing-3", &marker);
    clock.advance(chrono::Duration::hours(5) + chrono::Duration::seconds(1));
    let cleaned = monitor.clean(Some(SOURCE)).await.unwrap();
    assert_eq!(cleaned.expired_locks, 1);
    assert_eq!(cleaned.released_claims, 1);
    assert_eq!(cleaned.purged_log_entries, 0);
    assert_eq!(cleaned.purged_failure_entries, 0);

    // Failures age out of the stats window
    let later = monitor.stats(Some(SOURCE), 1).await.unwrap();
    assert_eq!(later.sources[0].dead_lettered_in_window, 0);
    assert!(later.sources[0].top_failure_reasons.is_empty());
}
