//! One billing cycle
//!
//! Runs the four billing tasks in order: due subscriptions, pending attempts,
//! retries, reconcile. A task that fails is logged and reported; the rest of
//! the cycle still runs.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

use crate::attempts::PendingAttemptProcessor;
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::due::SubscriptionProcessor;
use crate::error::BillingResult;
use crate::gateway::PaymentGateway;
use crate::reconcile::Reconciler;
use crate::retry::RetryService;
use crate::store::BillingStores;

pub const TASK_DUE_SUBSCRIPTIONS: &str = "due_subscriptions";
pub const TASK_PENDING_ATTEMPTS: &str = "pending_attempts";
pub const TASK_RETRIES: &str = "retries";
pub const TASK_RECONCILE: &str = "reconcile";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskReport {
    pub name: &'static str,
    pub processed: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    pub duration_ms: u64,
    pub tasks: Vec<TaskReport>,
    /// Cancellation arrived before every task ran.
    pub interrupted: bool,
}

impl CycleReport {
    pub fn total_processed(&self) -> usize {
        self.tasks.iter().map(|t| t.processed).sum()
    }

    pub fn failed_tasks(&self) -> usize {
        self.tasks.iter().filter(|t| t.error.is_some()).count()
    }

    pub fn task(&self, name: &str) -> Option<&TaskReport> {
        self.tasks.iter().find(|t| t.name == name)
    }
}

/// Billing engine wiring every processor to the same stores, gateway and clock.
pub struct BillingEngine {
    due: SubscriptionProcessor,
    pending: PendingAttemptProcessor,
    retry: RetryService,
    reconciler: Reconciler,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
}

impl BillingEngine {
    pub fn new(
        stores: BillingStores,
        gateway: Arc<dyn PaymentGateway>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Self {
        Self {
            due: SubscriptionProcessor::new(stores.clone(), gateway.clone(), clock.clone(), config.clone()),
            pending: PendingAttemptProcessor::new(stores.clone(), gateway, clock.clone()),
            retry: RetryService::new(stores.clone(), clock.clone(), config.clone()),
            reconciler: Reconciler::new(stores, clock.clone()),
            clock,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn subscriptions(&self) -> &SubscriptionProcessor {
        &self.due
    }

    pub fn pending_attempts(&self) -> &PendingAttemptProcessor {
        &self.pending
    }

    pub fn retries(&self) -> &RetryService {
        &self.retry
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    /// Run one full cycle. Cancellation is checked between tasks and between
    /// items inside a task, never inside a gateway call.
    pub async fn run_cycle(&self, cancel: &CancellationToken) -> CycleReport {
        let started_at = self.clock.now();
        let timer = Instant::now();
        let mut tasks = Vec::with_capacity(4);
        let mut interrupted = false;

        tracing::info!("Starting billing cycle");

        for name in [TASK_DUE_SUBSCRIPTIONS, TASK_PENDING_ATTEMPTS, TASK_RETRIES, TASK_RECONCILE] {
            if cancel.is_cancelled() {
                interrupted = true;
                tracing::info!(next_task = name, "Billing cycle interrupted by shutdown");
                break;
            }
            let report = match name {
                TASK_DUE_SUBSCRIPTIONS => {
                    run_task(name, self.due.process_due_subscriptions_until(self.config.due_subscription_limit, cancel))
                        .await
                }
                TASK_PENDING_ATTEMPTS => {
                    run_task(
                        name,
                        self.pending
                            .process_pending_attempts_until(self.config.pending_attempt_limit, cancel),
                    )
                    .await
                }
                TASK_RETRIES => run_task(name, self.run_retries()).await,
                _ => run_task(name, self.run_reconcile()).await,
            };
            tasks.push(report);
        }

        let report = CycleReport {
            started_at,
            duration_ms: u64::try_from(timer.elapsed().as_millis()).unwrap_or(u64::MAX),
            tasks,
            interrupted,
        };

        tracing::info!(
            duration_ms = report.duration_ms,
            processed = report.total_processed(),
            failed_tasks = report.failed_tasks(),
            interrupted = report.interrupted,
            "Billing cycle complete"
        );
        report
    }

    /// Queue retries, then close out cycles with none left.
    async fn run_retries(&self) -> BillingResult<usize> {
        let max_attempts = self.config.max_retry_attempts;
        let created = self.retry.retry_failed_billing(max_attempts).await?;
        let moved = self.retry.close_out_exhausted(max_attempts).await?;
        Ok(created + moved)
    }

    async fn run_reconcile(&self) -> BillingResult<usize> {
        let report = self.reconciler.reconcile(self.config.reconcile_limit).await?;
        Ok(report.total())
    }
}

async fn run_task<F>(name: &'static str, task: F) -> TaskReport
where
    F: Future<Output = BillingResult<usize>>,
{
    match task.await {
        Ok(processed) => {
            tracing::info!(task = name, processed = processed, "Billing task finished");
            TaskReport {
                name,
                processed,
                error: None,
            }
        }
        Err(e) => {
            tracing::error!(task = name, error = %e, "Billing task failed");
            TaskReport {
                name,
                processed: 0,
                error: Some(e.to_string()),
            }
        }
    }
}
