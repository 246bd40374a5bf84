//! Fixed-size pool of pipeline workers draining the trigger queue.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::pipeline::{Pipeline, Trigger};

pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Start `size` workers sharing `receiver`. Workers exit once every sender is dropped.
    pub fn spawn(pipeline: Arc<Pipeline>, receiver: mpsc::Receiver<Trigger>, size: usize) -> Self {
        let receiver = Arc::new(Mutex::new(receiver));

        let handles = (0..size.max(1))
            .map(|worker| {
                let pipeline = pipeline.clone();
                let receiver = receiver.clone();
                tokio::spawn(async move {
                    loop {
                        let next = receiver.lock().await.recv().await;
                        let Some(trigger) = next else {
                            break;
                        };
                        let outcome = pipeline.process(&trigger).await;
                        debug!(
                            "Worker {} finished request {} ({}): {:?}",
                            worker, trigger.request.id, trigger.source, outcome
                        );
                    }
                    debug!("Worker {} stopped", worker);
                })
            })
            .collect();

        info!("👷 Started {} pipeline worker(s)", size.max(1));
        Self { handles }
    }

    pub fn size(&self) -> usize {
        self.handles.len()
    }

    /// Wait for every worker to exit.
    pub async fn join(self) {
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::TriggerSource;
    use crate::testing::{harness, request, Harness};
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    #[tokio::test]
    async fn test_pool_fulfills_each_request_once() {
        let Harness {
            pipeline,
            ledger,
            provider,
            ..
        } = harness();
        provider.set_delay(Duration::from_millis(5));

        let (tx, rx) = mpsc::channel(32);
        let pool = WorkerPool::spawn(Arc::new(pipeline), rx, 4);
        assert_eq!(pool.size(), 4);

        for id in 0..5 {
            tx.send(Trigger::new(request(id), TriggerSource::Live)).await.unwrap();
            tx.send(Trigger::new(request(id), TriggerSource::Reconcile)).await.unwrap();
        }
        drop(tx);
        pool.join().await;

        assert_eq!(ledger.submissions(), 5);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 5);
        for id in 0..5 {
            assert!(ledger.is_fulfilled(id));
        }
    }
}
