//! The two ingestion paths feeding the worker queue.
//!
//! The live path follows request-created events as they are mined; the
//! reconciliation path periodically sweeps every request identifier and
//! re-queues the unfulfilled ones that nothing is working on. Both mark an
//! identifier queued before sending it, so at most one trigger per identifier
//! waits in the queue; the mark is cleared when a worker dequeues it.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};
use veritas_core::Result;
use veritas_state::ProcessingGuard;

use crate::ledger::Ledger;
use crate::pipeline::{Trigger, TriggerSource};

/// Block-cursor poller over `InferenceRequested` logs.
pub struct LiveWatcher {
    ledger: Arc<dyn Ledger>,
    guard: Arc<ProcessingGuard>,
    sender: mpsc::Sender<Trigger>,
    poll_interval: Duration,
    lookback_blocks: u64,
    max_range: u64,
    cursor: Option<u64>,
}

impl LiveWatcher {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        guard: Arc<ProcessingGuard>,
        sender: mpsc::Sender<Trigger>,
        poll_interval: Duration,
        lookback_blocks: u64,
        max_range: u64,
    ) -> Self {
        Self {
            ledger,
            guard,
            sender,
            poll_interval,
            lookback_blocks,
            max_range: max_range.max(1),
            cursor: None,
        }
    }

    /// Next block that will be scanned.
    pub fn cursor(&self) -> Option<u64> {
        self.cursor
    }

    pub async fn run(mut self) {
        info!("👂 Watching for InferenceRequested events");
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if self.sender.is_closed() {
                break;
            }
            if let Err(e) = self.poll_once().await {
                warn!("Event poll failed: {}", e);
            }
        }
        info!("Event watcher stopped");
    }

    /// Scan from the cursor to the head block. Returns how many triggers were queued.
    pub async fn poll_once(&mut self) -> Result<usize> {
        let head = self.ledger.latest_block().await?;
        let mut start = self
            .cursor
            .unwrap_or_else(|| head.saturating_sub(self.lookback_blocks));
        let mut queued = 0;

        while start <= head {
            let end = start.saturating_add(self.max_range - 1).min(head);
            let events = self.ledger.requested_events(start, end).await?;

            for request in events {
                let id = request.id;
                info!(
                    "📨 InferenceRequested id={} requester={}",
                    id, request.requester
                );
                if !self.guard.mark_queued(id).await {
                    debug!("Request {} already queued", id);
                    continue;
                }
                if self
                    .sender
                    .send(Trigger::new(request, TriggerSource::Live))
                    .await
                    .is_err()
                {
                    self.guard.clear_queued(id).await;
                    return Ok(queued);
                }
                queued += 1;
            }

            start = end + 1;
            self.cursor = Some(start);
        }

        Ok(queued)
    }
}

/// Periodic sweep over all request identifiers.
pub struct Reconciler {
    ledger: Arc<dyn Ledger>,
    guard: Arc<ProcessingGuard>,
    sender: mpsc::Sender<Trigger>,
    interval: Duration,
}

impl Reconciler {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        guard: Arc<ProcessingGuard>,
        sender: mpsc::Sender<Trigger>,
        interval: Duration,
    ) -> Self {
        Self {
            ledger,
            guard,
            sender,
            interval,
        }
    }

    pub async fn run(self) {
        info!("🔍 Reconciliation every {}ms", self.interval.as_millis());
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if self.sender.is_closed() {
                break;
            }
            match self.sweep().await {
                Ok(0) => {}
                Ok(queued) => info!("🔍 Reconciliation re-queued {} request(s)", queued),
                Err(e) => debug!("Reconciliation sweep failed: {}", e),
            }
        }
        info!("Reconciler stopped");
    }

    /// One pass over `0..totalRequests`. Returns how many triggers were queued.
    /// Stops early rather than wait when the queue is full.
    pub async fn sweep(&self) -> Result<usize> {
        let total = self.ledger.total_requests().await?;
        let mut queued = 0;

        for id in 0..total {
            if self.guard.is_blocked(id).await || self.guard.is_queued(id).await {
                continue;
            }

            let record = match self.ledger.get_request(id).await {
                Ok(record) => record,
                Err(e) => {
                    debug!("Reconciliation skipped request {}: {}", id, e);
                    continue;
                }
            };

            if record.fulfilled {
                if let Err(e) = self.guard.mark_fulfilled(id).await {
                    debug!("Could not record request {} as fulfilled: {}", id, e);
                }
                continue;
            }

            if !self.guard.mark_queued(id).await {
                continue;
            }
            match self
                .sender
                .try_send(Trigger::new(record.request, TriggerSource::Reconcile))
            {
                Ok(()) => queued += 1,
                Err(TrySendError::Full(_)) => {
                    self.guard.clear_queued(id).await;
                    debug!("Work queue full, reconciliation resumes at request {}", id);
                    break;
                }
                Err(TrySendError::Closed(_)) => {
                    self.guard.clear_queued(id).await;
                    break;
                }
            }
        }

        Ok(queued)
    }
}
