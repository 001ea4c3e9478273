//! Billing scheduler
//!
//! Runs one billing cycle as soon as it starts, then one per interval, until
//! its cancellation token fires or [`BillingScheduler::stop`] is called. An
//! in-flight cycle is allowed to finish its current item.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cadence_billing::{BillingEngine, CycleReport};
use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::error::{WorkerError, WorkerResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Stopped,
    Running,
}

/// Last known state of one scheduler, as reported to operators.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub status: WorkerStatus,
    pub cycles_completed: u64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_cycle_at: Option<OffsetDateTime>,
    pub last_cycle: Option<CycleReport>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl Default for HealthSnapshot {
    fn default() -> Self {
        Self {
            status: WorkerStatus::Stopped,
            cycles_completed: 0,
            last_cycle_at: None,
            last_cycle: None,
            timestamp: OffsetDateTime::now_utc(),
        }
    }
}

pub struct BillingScheduler {
    engine: Arc<BillingEngine>,
    interval: Duration,
    running: AtomicBool,
    stop: Mutex<Option<CancellationToken>>,
    health: Arc<RwLock<HealthSnapshot>>,
}

impl BillingScheduler {
    pub fn new(engine: Arc<BillingEngine>, interval: Duration) -> Self {
        Self {
            engine,
            interval,
            running: AtomicBool::new(false),
            stop: Mutex::new(None),
            health: Arc::new(RwLock::new(HealthSnapshot::default())),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Run until `cancel` fires or [`Self::stop`] is called.
    pub async fn run(&self, cancel: CancellationToken) -> WorkerResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(WorkerError::AlreadyRunning);
        }

        let token = cancel.child_token();
        if let Ok(mut stop) = self.stop.lock() {
            *stop = Some(token.clone());
        }
        self.set_status(WorkerStatus::Running).await;
        tracing::info!(interval_secs = self.interval.as_secs(), "Billing scheduler started");

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = token.cancelled() => break,
                _ = ticker.tick() => {
                    let report = self.engine.run_cycle(&token).await;
                    self.record_cycle(report).await;
                }
            }
        }

        if let Ok(mut stop) = self.stop.lock() {
            *stop = None;
        }
        self.set_status(WorkerStatus::Stopped).await;
        self.running.store(false, Ordering::SeqCst);
        tracing::info!("Billing scheduler stopped");
        Ok(())
    }

    /// Ask a running scheduler to return after its current item.
    pub fn stop(&self) {
        if let Ok(stop) = self.stop.lock() {
            if let Some(token) = stop.as_ref() {
                tracing::info!("Stopping billing scheduler on request");
                token.cancel();
            }
        }
    }

    pub async fn health(&self) -> HealthSnapshot {
        let mut snapshot = self.health.read().await.clone();
        snapshot.timestamp = OffsetDateTime::now_utc();
        snapshot
    }

    async fn set_status(&self, status: WorkerStatus) {
        self.health.write().await.status = status;
    }

    async fn record_cycle(&self, report: CycleReport) {
        let mut health = self.health.write().await;
        health.cycles_completed += 1;
        health.last_cycle_at = Some(report.started_at);
        health.last_cycle = Some(report);
    }
}
