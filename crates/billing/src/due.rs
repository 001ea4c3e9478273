//! Due-subscription processing
//!
//! Picks subscriptions whose `next_billing_at` has arrived and drives one
//! billing cycle for each: open the ordinal-1 attempt for the cycle, charge the
//! card, then either advance the period or mark the subscription past due.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::charge::{charge_card, mark_past_due, record_transaction, settle_cycle, ChargeOutcome};
use crate::clock::Clock;
use crate::config::{EngineConfig, DUE_SUBSCRIPTION_HARD_CAP};
use crate::error::{BillingError, BillingResult};
use crate::gateway::PaymentGateway;
use crate::models::{AttemptStatus, BillingAttempt, Subscription};
use crate::store::BillingStores;

/// What happened to one due subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DueOutcome {
    /// Charged and the period advanced (or queued for reconcile).
    Charged,
    /// Gateway declined or errored; subscription marked past due.
    Failed,
    /// No usable card; attempt failed, subscription untouched.
    CardMissing,
    /// The cycle already has an attempt from another pass.
    AlreadyAttempted,
    /// The cycle was already paid; only the period advance was missing.
    Repaired,
}

pub struct SubscriptionProcessor {
    stores: BillingStores,
    gateway: Arc<dyn PaymentGateway>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
}

impl SubscriptionProcessor {
    pub fn new(
        stores: BillingStores,
        gateway: Arc<dyn PaymentGateway>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Self {
        Self {
            stores,
            gateway,
            clock,
            config,
        }
    }

    /// Bill every due subscription, stopping after `limit` successful charges.
    /// Returns the number of successful charges.
    pub async fn process_due_subscriptions(&self, limit: i64) -> BillingResult<usize> {
        self.process_due_subscriptions_until(limit, &CancellationToken::new())
            .await
    }

    /// Same as [`Self::process_due_subscriptions`], checking `cancel` between subscriptions.
    pub async fn process_due_subscriptions_until(
        &self,
        limit: i64,
        cancel: &CancellationToken,
    ) -> BillingResult<usize> {
        let now = self.clock.now();
        let cutoff = now + self.config.due_lookahead();
        let due = self
            .stores
            .subscriptions
            .get_due_subscriptions(cutoff, now, DUE_SUBSCRIPTION_HARD_CAP)
            .await?;

        let limit = usize::try_from(limit.clamp(0, DUE_SUBSCRIPTION_HARD_CAP)).unwrap_or(0);
        tracing::info!(due = due.len(), limit = limit, cutoff = %cutoff, "Processing due subscriptions");

        let mut charged = 0usize;
        for sub in due {
            if charged >= limit {
                break;
            }
            if cancel.is_cancelled() {
                tracing::info!(charged = charged, "Due subscription processing interrupted by shutdown");
                break;
            }

            match self.process_subscription(&sub).await {
                Ok(DueOutcome::Charged) => charged += 1,
                Ok(outcome) => {
                    tracing::debug!(subscription_id = %sub.id, outcome = ?outcome, "Due subscription not charged");
                }
                Err(e) => {
                    tracing::warn!(subscription_id = %sub.id, error = %e, "Failed to process due subscription");
                }
            }
        }

        tracing::info!(charged = charged, "Due subscription processing complete");
        Ok(charged)
    }

    /// Run one billing cycle for one subscription.
    pub async fn process_subscription(&self, sub: &Subscription) -> BillingResult<DueOutcome> {
        let now = self.clock.now();
        let mut attempt =
            BillingAttempt::first_for_cycle(sub, sub.next_billing_at, AttemptStatus::Processing, now);

        match self.stores.attempts.create_attempt(&attempt).await {
            Ok(()) => {}
            Err(BillingError::Conflict(_)) => return self.resolve_existing_cycle(sub).await,
            Err(e) => return Err(e),
        }

        let card = match sub.card_id {
            Some(card_id) => self.stores.cards.get_card(card_id).await,
            None => Err(BillingError::not_found("card", "none")),
        };
        let card = match card {
            Ok(card) => card,
            Err(e) => {
                let message = if e.is_not_found() {
                    "card not found".to_string()
                } else {
                    format!("card lookup failed: {}", e)
                };
                attempt.mark_failed(None, message, self.clock.now());
                self.stores.attempts.update_attempt(&attempt).await?;
                tracing::warn!(subscription_id = %sub.id, attempt_id = %attempt.id, error = %e, "No usable card for subscription");
                return if e.is_not_found() {
                    Ok(DueOutcome::CardMissing)
                } else {
                    Err(e)
                };
            }
        };

        let outcome = charge_card(self.gateway.as_ref(), &card, &attempt).await;
        let now = self.clock.now();
        outcome.apply(&mut attempt, now);

        if let Err(e) = self.stores.attempts.update_attempt(&attempt).await {
            tracing::error!(
                subscription_id = %sub.id,
                attempt_id = %attempt.id,
                status = %attempt.status,
                error = %e,
                "Failed to persist attempt outcome - RECONCILIATION NEEDED"
            );
        }

        match outcome {
            ChargeOutcome::Approved(resp) => {
                record_transaction(self.stores.transactions.as_ref(), sub, &attempt, &resp, now).await;

                match settle_cycle(self.stores.subscriptions.as_ref(), sub.id, attempt.period_start).await {
                    Ok(Some(advanced)) => tracing::info!(
                        subscription_id = %sub.id,
                        attempt_id = %attempt.id,
                        amount_cents = attempt.amount_cents,
                        next_billing_at = %advanced.next_billing_at,
                        "Subscription charged"
                    ),
                    Ok(None) => tracing::warn!(
                        subscription_id = %sub.id,
                        attempt_id = %attempt.id,
                        "Subscription charged but period had already moved"
                    ),
                    Err(e) => tracing::error!(
                        subscription_id = %sub.id,
                        attempt_id = %attempt.id,
                        error = %e,
                        "Charge succeeded but period was not advanced - RECONCILIATION NEEDED"
                    ),
                }
                Ok(DueOutcome::Charged)
            }
            ChargeOutcome::Declined { code, message } => {
                tracing::warn!(
                    subscription_id = %sub.id,
                    attempt_id = %attempt.id,
                    error_code = code.as_deref().unwrap_or(""),
                    reason = %message,
                    "Subscription charge declined"
                );
                mark_past_due(self.stores.subscriptions.as_ref(), sub.id).await?;
                Ok(DueOutcome::Failed)
            }
            ChargeOutcome::Error(message) => {
                tracing::warn!(
                    subscription_id = %sub.id,
                    attempt_id = %attempt.id,
                    error = %message,
                    "Gateway error charging subscription"
                );
                mark_past_due(self.stores.subscriptions.as_ref(), sub.id).await?;
                Ok(DueOutcome::Failed)
            }
        }
    }

    /// Another pass already opened this cycle. If it was paid, finish the
    /// period advance it may have missed; otherwise leave it to that pass.
    async fn resolve_existing_cycle(&self, sub: &Subscription) -> BillingResult<DueOutcome> {
        let cycle = self
            .stores
            .attempts
            .get_cycle_attempts(sub.id, sub.next_billing_at)
            .await?;

        if cycle.iter().any(|a| a.status == AttemptStatus::Succeeded) {
            if settle_cycle(self.stores.subscriptions.as_ref(), sub.id, sub.next_billing_at)
                .await?
                .is_some()
            {
                tracing::warn!(subscription_id = %sub.id, period_start = %sub.next_billing_at, "Advanced period of an already-paid cycle");
            }
            return Ok(DueOutcome::Repaired);
        }

        tracing::debug!(subscription_id = %sub.id, attempts = cycle.len(), "Cycle already attempted, skipping");
        Ok(DueOutcome::AlreadyAttempted)
    }
}
