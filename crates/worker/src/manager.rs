//! Worker manager
//!
//! Owns the shared cancellation token and the task handle of every
//! registered scheduler.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{WorkerError, WorkerResult};
use crate::scheduler::{BillingScheduler, HealthSnapshot};

struct Running {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

pub struct WorkerManager {
    workers: Mutex<Vec<Arc<BillingScheduler>>>,
    running: Mutex<Option<Running>>,
    stop_grace: Duration,
}

impl WorkerManager {
    pub fn new(stop_grace: Duration) -> Self {
        Self {
            workers: Mutex::new(Vec::new()),
            running: Mutex::new(None),
            stop_grace,
        }
    }

    pub async fn register(&self, worker: Arc<BillingScheduler>) {
        self.workers.lock().await.push(worker);
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Launch one task per registered worker under a fresh cancellation token.
    pub async fn start_all(&self) -> WorkerResult<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(WorkerError::AlreadyRunning);
        }

        let cancel = CancellationToken::new();
        let workers = self.workers.lock().await;
        let mut handles = Vec::with_capacity(workers.len());
        for (index, worker) in workers.iter().enumerate() {
            let worker = worker.clone();
            let token = cancel.clone();
            handles.push(tokio::spawn(async move {
                if let Err(e) = worker.run(token).await {
                    tracing::error!(worker = index, error = %e, "Worker exited with error");
                }
            }));
        }

        tracing::info!(workers = handles.len(), "Workers started");
        *running = Some(Running { cancel, handles });
        Ok(())
    }

    /// Cancel every worker, wait for each to return, then wait out the grace period.
    pub async fn stop_all(&self) {
        let Some(Running { cancel, handles }) = self.running.lock().await.take() else {
            return;
        };

        tracing::info!(workers = handles.len(), "Stopping workers");
        cancel.cancel();
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Worker task panicked");
            }
        }

        tokio::time::sleep(self.stop_grace).await;
        tracing::info!("All workers stopped");
    }

    pub async fn restart(&self) -> WorkerResult<()> {
        self.stop_all().await;
        self.start_all().await
    }

    /// Health of every worker keyed `worker_<index>`.
    pub async fn health(&self) -> BTreeMap<String, HealthSnapshot> {
        let workers = self.workers.lock().await.clone();
        let mut health = BTreeMap::new();
        for (index, worker) in workers.iter().enumerate() {
            health.insert(format!("worker_{}", index), worker.health().await);
        }
        health
    }
}
