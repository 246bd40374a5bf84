//! The dedup / idempotency guard.
//!
//! Every trigger for a request identifier goes through [`ProcessingGuard::try_acquire`]
//! before any side effect. The check-and-set runs under the entry map lock, so
//! concurrent triggers from the live and reconciliation paths cannot both win.
//! Writes for one identifier are serialized by its own lock and persisted
//! after the map lock is dropped; a slow store write for one request never
//! holds up another.
//!
//! A released identifier may be acquired again once its backoff elapses; a
//! parked identifier waits for an explicit [`ProcessingGuard::unpark`]; a
//! fulfilled identifier is never released.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use veritas_core::{AuditPackage, ProcessingStage, RequestId, Result};

use crate::store::StateStore;

const KEY_PREFIX: &str = "guard:";

/// Guard state for one request identifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardEntry {
    pub request_id: RequestId,

    /// Furthest stage reached by the current or last attempt.
    pub stage: ProcessingStage,

    /// True while an attempt owns this identifier.
    pub held: bool,

    /// True after a failure no automatic retry can fix.
    #[serde(default)]
    pub parked: bool,

    /// Number of attempts started.
    pub attempts: u32,

    /// Error that released or parked the last attempt.
    pub last_error: Option<String>,

    /// Earliest time the identifier may be acquired again.
    pub retry_after: Option<DateTime<Utc>>,

    /// Package built from a successful provider call, reused by later attempts.
    pub output: Option<AuditPackage>,

    pub updated_at: DateTime<Utc>,
}

impl GuardEntry {
    fn new(request_id: RequestId) -> Self {
        Self {
            request_id,
            stage: ProcessingStage::Guarded,
            held: false,
            parked: false,
            attempts: 0,
            last_error: None,
            retry_after: None,
            output: None,
            updated_at: Utc::now(),
        }
    }

    pub fn is_fulfilled(&self) -> bool {
        self.stage.is_terminal()
    }
}

/// Result of an acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acquire {
    /// The caller now owns the identifier.
    Acquired {
        attempt: u32,
        memoized: Option<AuditPackage>,
    },
    /// Another attempt is running.
    InFlight(ProcessingStage),
    /// Already fulfilled; nothing to do.
    Fulfilled,
    /// Released recently; not eligible until the given time.
    CoolingDown(DateTime<Utc>),
    /// Stopped at the given stage until someone unparks it.
    Parked(ProcessingStage),
}

/// Exponential backoff between attempts, capped at `max_delay`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// No delay between attempts.
    pub fn immediate() -> Self {
        Self {
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay after the `attempts`-th failed attempt.
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

/// Counts from a startup recovery pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Entries found mid-attempt and released for retry.
    pub released: usize,
    /// Entries already fulfilled.
    pub fulfilled: usize,
    /// Entries waiting for a retry.
    pub pending: usize,
    /// Entries waiting for a manual retry.
    pub parked: usize,
}

/// Per-identifier mutual exclusion with durable stage tracking.
pub struct ProcessingGuard {
    entries: Mutex<HashMap<RequestId, GuardEntry>>,
    writers: Mutex<HashMap<RequestId, Arc<Mutex<()>>>>,
    queued: Mutex<HashSet<RequestId>>,
    store: Arc<dyn StateStore>,
    policy: RetryPolicy,
}

impl ProcessingGuard {
    pub fn new(store: Arc<dyn StateStore>, policy: RetryPolicy) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            writers: Mutex::new(HashMap::new()),
            queued: Mutex::new(HashSet::new()),
            store,
            policy,
        }
    }

    /// Load persisted entries. Attempts that were in flight when the process
    /// died are released so the next trigger restarts them.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let persisted = self.store.get_prefix(KEY_PREFIX).await?;
        let mut report = RecoveryReport::default();
        let mut interrupted = Vec::new();
        let mut recovered = HashMap::new();

        for row in persisted {
            let mut entry: GuardEntry = match serde_json::from_value(row.value) {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Skipping unreadable guard entry {}: {}", row.key, e);
                    continue;
                }
            };

            if entry.is_fulfilled() {
                report.fulfilled += 1;
            } else if entry.held {
                entry.held = false;
                entry.last_error = Some(format!("interrupted during {}", entry.stage));
                entry.retry_after = None;
                entry.updated_at = Utc::now();
                interrupted.push(entry.clone());
                report.released += 1;
            } else if entry.parked {
                report.parked += 1;
            } else {
                report.pending += 1;
            }

            recovered.insert(entry.request_id, entry);
        }

        self.entries.lock().await.extend(recovered);
        for entry in &interrupted {
            self.persist(entry).await?;
        }

        if report.released > 0 {
            info!(
                "♻️  Released {} request(s) interrupted by a restart",
                report.released
            );
        }

        Ok(report)
    }

    /// Atomically claim `id` for one attempt. Also takes `id` off the queue.
    pub async fn try_acquire(&self, id: RequestId) -> Result<Acquire> {
        self.queued.lock().await.remove(&id);

        let writer = self.writer(id).await;
        let _write = writer.lock().await;

        let (acquired, snapshot) = {
            let mut entries = self.entries.lock().await;
            let now = Utc::now();
            let entry = entries.entry(id).or_insert_with(|| GuardEntry::new(id));

            if entry.is_fulfilled() {
                return Ok(Acquire::Fulfilled);
            }
            if entry.held {
                return Ok(Acquire::InFlight(entry.stage));
            }
            if entry.parked {
                return Ok(Acquire::Parked(entry.stage));
            }
            if let Some(until) = entry.retry_after {
                if until > now {
                    return Ok(Acquire::CoolingDown(until));
                }
            }

            entry.held = true;
            entry.stage = ProcessingStage::Guarded;
            entry.attempts += 1;
            entry.retry_after = None;
            entry.updated_at = now;

            let acquired = Acquire::Acquired {
                attempt: entry.attempts,
                memoized: entry.output.clone(),
            };
            (acquired, entry.clone())
        };

        if let Err(e) = self.persist(&snapshot).await {
            // Undo so the identifier is not stuck held without an owner
            if let Some(entry) = self.entries.lock().await.get_mut(&id) {
                entry.held = false;
                entry.attempts -= 1;
            }
            return Err(e);
        }

        debug!("Guard acquired for request {} (attempt {})", id, snapshot.attempts);
        Ok(acquired)
    }

    /// Record progress of the owning attempt.
    pub async fn advance(&self, id: RequestId, stage: ProcessingStage) -> Result<()> {
        self.update(id, |entry| {
            entry.stage = stage;
        })
        .await
    }

    /// Keep the package built from a successful provider call for later attempts.
    pub async fn remember_output(&self, id: RequestId, package: AuditPackage) -> Result<()> {
        self.update(id, |entry| {
            entry.output = Some(package);
        })
        .await
    }

    /// Give up the current attempt after a retryable failure.
    /// Returns the time the identifier becomes eligible again.
    pub async fn release(
        &self,
        id: RequestId,
        stage: ProcessingStage,
        error: impl Into<String>,
    ) -> Result<DateTime<Utc>> {
        let error = error.into();
        let policy = self.policy;

        self.update(id, |entry| {
            let delay = policy.delay_for(entry.attempts);
            let retry_at = Utc::now()
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
            entry.held = false;
            entry.stage = stage;
            entry.last_error = Some(error);
            entry.retry_after = Some(retry_at);
            retry_at
        })
        .await
    }

    /// Give up the current attempt after a failure retrying cannot fix.
    /// The identifier stays parked until [`ProcessingGuard::unpark`].
    pub async fn park(
        &self,
        id: RequestId,
        stage: ProcessingStage,
        error: impl Into<String>,
    ) -> Result<()> {
        let error = error.into();
        self.update(id, |entry| {
            entry.held = false;
            entry.parked = true;
            entry.stage = stage;
            entry.last_error = Some(error);
            entry.retry_after = None;
        })
        .await
    }

    /// Make a parked identifier eligible again. Returns true if it was parked.
    pub async fn unpark(&self, id: RequestId) -> Result<bool> {
        let writer = self.writer(id).await;
        let _write = writer.lock().await;

        let snapshot = {
            let mut entries = self.entries.lock().await;
            let Some(entry) = entries.get_mut(&id) else {
                return Ok(false);
            };
            if !entry.parked {
                return Ok(false);
            }
            entry.parked = false;
            entry.retry_after = None;
            entry.updated_at = Utc::now();
            entry.clone()
        };

        self.persist(&snapshot).await?;
        info!("🔓 Request {} unparked", id);
        Ok(true)
    }

    /// Mark `id` fulfilled. The identifier stays marked forever.
    pub async fn complete(&self, id: RequestId) -> Result<()> {
        self.update(id, |entry| {
            entry.held = false;
            entry.parked = false;
            entry.stage = ProcessingStage::Fulfilled;
            entry.last_error = None;
            entry.retry_after = None;
            entry.output = None;
        })
        .await
    }

    /// Mark `id` fulfilled without processing it (the ledger says it is done).
    pub async fn mark_fulfilled(&self, id: RequestId) -> Result<()> {
        let writer = self.writer(id).await;
        let _write = writer.lock().await;

        let snapshot = {
            let mut entries = self.entries.lock().await;
            let entry = entries.entry(id).or_insert_with(|| GuardEntry::new(id));
            if entry.held || entry.is_fulfilled() {
                return Ok(());
            }
            entry.stage = ProcessingStage::Fulfilled;
            entry.parked = false;
            entry.output = None;
            entry.updated_at = Utc::now();
            entry.clone()
        };

        self.persist(&snapshot).await
    }

    /// Record that a trigger for `id` is waiting in the work queue.
    /// Returns false if one already is.
    pub async fn mark_queued(&self, id: RequestId) -> bool {
        self.queued.lock().await.insert(id)
    }

    /// Forget a queued mark whose trigger never reached the queue.
    pub async fn clear_queued(&self, id: RequestId) {
        self.queued.lock().await.remove(&id);
    }

    pub async fn is_queued(&self, id: RequestId) -> bool {
        self.queued.lock().await.contains(&id)
    }

    /// Current entry for `id`.
    pub async fn entry(&self, id: RequestId) -> Option<GuardEntry> {
        self.entries.lock().await.get(&id).cloned()
    }

    /// True if a trigger for `id` would be absorbed right now.
    pub async fn is_blocked(&self, id: RequestId) -> bool {
        let entries = self.entries.lock().await;
        match entries.get(&id) {
            None => false,
            Some(entry) => {
                entry.held
                    || entry.parked
                    || entry.is_fulfilled()
                    || entry.retry_after.is_some_and(|until| until > Utc::now())
            }
        }
    }

    async fn writer(&self, id: RequestId) -> Arc<Mutex<()>> {
        self.writers.lock().await.entry(id).or_default().clone()
    }

    async fn update<F, T>(&self, id: RequestId, f: F) -> Result<T>
    where
        F: FnOnce(&mut GuardEntry) -> T,
    {
        let writer = self.writer(id).await;
        let _write = writer.lock().await;

        let (value, snapshot) = {
            let mut entries = self.entries.lock().await;
            let entry = entries.entry(id).or_insert_with(|| GuardEntry::new(id));
            let value = f(entry);
            entry.updated_at = Utc::now();
            (value, entry.clone())
        };

        self.persist(&snapshot).await?;
        Ok(value)
    }

    async fn persist(&self, entry: &GuardEntry) -> Result<()> {
        let key = format!("{}{}", KEY_PREFIX, entry.request_id);
        self.store.set(&key, serde_json::to_value(entry)?).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryStateStore, StateEntry};
    use async_trait::async_trait;
    use tokio::time::Instant;
    use veritas_core::{Address, B256};

    fn create_test_guard() -> ProcessingGuard {
        ProcessingGuard::new(Arc::new(InMemoryStateStore::new()), RetryPolicy::immediate())
    }

    fn acquired(result: Acquire) -> bool {
        matches!(result, Acquire::Acquired { .. })
    }

    fn package(output: &str) -> AuditPackage {
        AuditPackage::new(9, B256::ZERO, "hi", "llama3-8b-8192", output, Address::default())
    }

    /// Delays writes of one key.
    struct SlowStore {
        inner: InMemoryStateStore,
        slow_key: &'static str,
        delay: Duration,
    }

    #[async_trait]
    impl StateStore for SlowStore {
        async fn get_prefix(&self, prefix: &str) -> Result<Vec<StateEntry>> {
            self.inner.get_prefix(prefix).await
        }

        async fn set(&self, key: &str, value: serde_json::Value) -> Result<()> {
            if key == self.slow_key {
                tokio::time::sleep(self.delay).await;
            }
            self.inner.set(key, value).await
        }
    }

    #[tokio::test]
    async fn test_second_acquire_is_absorbed() {
        let guard = create_test_guard();

        assert!(acquired(guard.try_acquire(7).await.unwrap()));
        assert_eq!(
            guard.try_acquire(7).await.unwrap(),
            Acquire::InFlight(ProcessingStage::Guarded)
        );
        assert!(acquired(guard.try_acquire(8).await.unwrap()));
    }

    #[tokio::test]
    async fn test_concurrent_acquire_single_winner() {
        let guard = Arc::new(create_test_guard());

        let attempts = (0..32).map(|_| {
            let guard = guard.clone();
            tokio::spawn(async move { acquired(guard.try_acquire(3).await.unwrap()) })
        });
        let results = futures::future::join_all(attempts).await;
        let winners = results.into_iter().filter(|r| *r.as_ref().unwrap()).count();

        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_slow_write_does_not_block_other_requests() {
        let guard = Arc::new(ProcessingGuard::new(
            Arc::new(SlowStore {
                inner: InMemoryStateStore::new(),
                slow_key: "guard:1",
                delay: Duration::from_millis(500),
            }),
            RetryPolicy::immediate(),
        ));

        let slow = {
            let guard = guard.clone();
            tokio::spawn(async move { guard.try_acquire(1).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let started = Instant::now();
        assert!(acquired(guard.try_acquire(2).await.unwrap()));
        assert!(started.elapsed() < Duration::from_millis(250));

        // the same identifier still waits for its own write
        assert_eq!(
            guard.try_acquire(1).await.unwrap(),
            Acquire::InFlight(ProcessingStage::Guarded)
        );
        assert!(acquired(slow.await.unwrap().unwrap()));
    }

    #[tokio::test]
    async fn test_release_allows_retry() {
        let guard = create_test_guard();

        guard.try_acquire(1).await.unwrap();
        guard.advance(1, ProcessingStage::Inferring).await.unwrap();
        guard.release(1, ProcessingStage::Inferring, "quota").await.unwrap();

        let entry = guard.entry(1).await.unwrap();
        assert!(!entry.held);
        assert_eq!(entry.last_error.as_deref(), Some("quota"));

        match guard.try_acquire(1).await.unwrap() {
            Acquire::Acquired { attempt, .. } => assert_eq!(attempt, 2),
            other => panic!("expected reacquire, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_parked_until_unparked() {
        let guard = create_test_guard();

        guard.try_acquire(4).await.unwrap();
        guard.park(4, ProcessingStage::Hashing, "unserializable").await.unwrap();

        assert_eq!(
            guard.try_acquire(4).await.unwrap(),
            Acquire::Parked(ProcessingStage::Hashing)
        );
        assert!(guard.is_blocked(4).await);

        assert!(guard.unpark(4).await.unwrap());
        assert!(!guard.unpark(4).await.unwrap());
        assert!(!guard.is_blocked(4).await);
        assert!(acquired(guard.try_acquire(4).await.unwrap()));
    }

    #[tokio::test]
    async fn test_fulfilled_is_terminal() {
        let guard = create_test_guard();

        guard.try_acquire(5).await.unwrap();
        guard.complete(5).await.unwrap();

        assert_eq!(guard.try_acquire(5).await.unwrap(), Acquire::Fulfilled);
        assert!(guard.is_blocked(5).await);
    }

    #[tokio::test]
    async fn test_backoff_blocks_until_elapsed() {
        let guard = ProcessingGuard::new(
            Arc::new(InMemoryStateStore::new()),
            RetryPolicy {
                base_delay: Duration::from_secs(30),
                max_delay: Duration::from_secs(60),
            },
        );

        guard.try_acquire(2).await.unwrap();
        guard.release(2, ProcessingStage::Submitting, "reverted").await.unwrap();

        assert!(matches!(
            guard.try_acquire(2).await.unwrap(),
            Acquire::CoolingDown(_)
        ));
        assert!(guard.is_blocked(2).await);
    }

    #[test]
    fn test_retry_policy_is_bounded() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(4), Duration::from_millis(800));
        assert_eq!(policy.delay_for(40), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_memoized_package_returned_on_retry() {
        let guard = create_test_guard();
        let memo = package("hello");

        guard.try_acquire(9).await.unwrap();
        guard.remember_output(9, memo.clone()).await.unwrap();
        guard.release(9, ProcessingStage::Submitting, "timeout").await.unwrap();

        match guard.try_acquire(9).await.unwrap() {
            Acquire::Acquired { memoized, .. } => assert_eq!(memoized, Some(memo)),
            other => panic!("expected reacquire, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_queued_mark_cleared_on_dequeue() {
        let guard = create_test_guard();

        assert!(guard.mark_queued(6).await);
        assert!(!guard.mark_queued(6).await);
        assert!(guard.is_queued(6).await);

        guard.try_acquire(6).await.unwrap();
        assert!(!guard.is_queued(6).await);

        guard.mark_queued(7).await;
        guard.clear_queued(7).await;
        assert!(guard.mark_queued(7).await);
    }

    #[tokio::test]
    async fn test_recover_releases_interrupted_attempts() {
        let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());

        {
            let guard = ProcessingGuard::new(store.clone(), RetryPolicy::immediate());
            guard.try_acquire(1).await.unwrap();
            guard.advance(1, ProcessingStage::Publishing).await.unwrap();
            guard.try_acquire(2).await.unwrap();
            guard.complete(2).await.unwrap();
            guard.try_acquire(3).await.unwrap();
            guard.park(3, ProcessingStage::Hashing, "bad").await.unwrap();
        }

        let restarted = ProcessingGuard::new(store, RetryPolicy::immediate());
        let report = restarted.recover().await.unwrap();

        assert_eq!(report.released, 1);
        assert_eq!(report.fulfilled, 1);
        assert_eq!(report.parked, 1);
        assert!(acquired(restarted.try_acquire(1).await.unwrap()));
        assert_eq!(restarted.try_acquire(2).await.unwrap(), Acquire::Fulfilled);
        assert_eq!(
            restarted.try_acquire(3).await.unwrap(),
            Acquire::Parked(ProcessingStage::Hashing)
        );
    }
}
