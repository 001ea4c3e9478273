//! Repair of partial writes on the success path
//!
//! A charge can succeed at the gateway while the transaction insert, the
//! period advance or the status restore that follows it fails. This pass
//! finds succeeded attempts with any of those gaps and closes them.

use std::sync::Arc;

use serde::Serialize;

use crate::charge::{restore_after_payment, settle_cycle};
use crate::clock::Clock;
use crate::error::BillingResult;
use crate::models::{BillingAttempt, Transaction};
use crate::store::BillingStores;

/// Gateway status written on transactions recorded after the fact.
pub const RECONCILED_STATUS: &str = "reconciled";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub transactions_recorded: usize,
    pub periods_advanced: usize,
    pub statuses_restored: usize,
}

impl ReconcileReport {
    pub fn total(&self) -> usize {
        self.transactions_recorded + self.periods_advanced + self.statuses_restored
    }
}

pub struct Reconciler {
    stores: BillingStores,
    clock: Arc<dyn Clock>,
}

impl Reconciler {
    pub fn new(stores: BillingStores, clock: Arc<dyn Clock>) -> Self {
        Self { stores, clock }
    }

    pub async fn reconcile(&self, limit: i64) -> BillingResult<ReconcileReport> {
        let mut report = ReconcileReport::default();

        let unrecorded = self.stores.attempts.get_unrecorded_successes(limit).await?;
        for attempt in unrecorded {
            match self.record_missing_transaction(&attempt).await {
                Ok(true) => report.transactions_recorded += 1,
                Ok(false) => {}
                Err(e) => tracing::warn!(
                    attempt_id = %attempt.id,
                    subscription_id = %attempt.subscription_id,
                    error = %e,
                    "Failed to record missing transaction"
                ),
            }
        }

        let unadvanced = self.stores.attempts.get_unadvanced_successes(limit).await?;
        for attempt in unadvanced {
            match settle_cycle(self.stores.subscriptions.as_ref(), attempt.subscription_id, attempt.period_start).await {
                Ok(Some(sub)) => {
                    tracing::info!(
                        subscription_id = %sub.id,
                        attempt_id = %attempt.id,
                        next_billing_at = %sub.next_billing_at,
                        "Advanced period for already-paid cycle"
                    );
                    report.periods_advanced += 1;
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(
                    attempt_id = %attempt.id,
                    subscription_id = %attempt.subscription_id,
                    error = %e,
                    "Failed to advance period for paid cycle"
                ),
            }
        }

        let stranded = self.stores.attempts.get_stranded_successes(limit).await?;
        for attempt in stranded {
            match restore_after_payment(
                self.stores.subscriptions.as_ref(),
                self.stores.attempts.as_ref(),
                attempt.subscription_id,
            )
            .await
            {
                Ok(Some(sub)) => {
                    tracing::info!(
                        subscription_id = %sub.id,
                        attempt_id = %attempt.id,
                        "Restored active status for paid subscription"
                    );
                    report.statuses_restored += 1;
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(
                    attempt_id = %attempt.id,
                    subscription_id = %attempt.subscription_id,
                    error = %e,
                    "Failed to restore status for paid subscription"
                ),
            }
        }

        if report.total() > 0 {
            tracing::info!(
                transactions_recorded = report.transactions_recorded,
                periods_advanced = report.periods_advanced,
                statuses_restored = report.statuses_restored,
                "Reconciliation repaired partial writes"
            );
        }
        Ok(report)
    }

    async fn record_missing_transaction(&self, attempt: &BillingAttempt) -> BillingResult<bool> {
        let sub = self.stores.subscriptions.get_subscription(attempt.subscription_id).await?;
        let txn = Transaction::recurring(
            &sub,
            attempt,
            RECONCILED_STATUS.to_string(),
            attempt.gateway_transaction_id.clone().unwrap_or_default(),
            self.clock.now(),
        );

        match self.stores.transactions.create_transaction(&txn).await {
            Ok(()) => {
                tracing::info!(
                    subscription_id = %sub.id,
                    attempt_id = %attempt.id,
                    transaction_id = %txn.id,
                    "Recorded missing transaction"
                );
                Ok(true)
            }
            Err(e) if e.is_conflict() => Ok(false),
            Err(e) => Err(e),
        }
    }
}
