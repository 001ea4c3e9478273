//! Pending billing attempt processing
//!
//! Drains attempts created outside the due-subscription path: the first
//! charge of a new subscription, retries queued by the retry policy, and
//! operator-created attempts. Each attempt is claimed before charging so two
//! processors never charge the same attempt.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::charge::{charge_card, record_transaction, restore_after_payment, settle_cycle, ChargeOutcome};
use crate::clock::Clock;
use crate::error::BillingResult;
use crate::gateway::PaymentGateway;
use crate::models::{BillingAttempt, SubscriptionStatus};
use crate::store::BillingStores;

pub struct PendingAttemptProcessor {
    stores: BillingStores,
    gateway: Arc<dyn PaymentGateway>,
    clock: Arc<dyn Clock>,
}

impl PendingAttemptProcessor {
    pub fn new(stores: BillingStores, gateway: Arc<dyn PaymentGateway>, clock: Arc<dyn Clock>) -> Self {
        Self {
            stores,
            gateway,
            clock,
        }
    }

    /// Charge up to `limit` pending attempts that are due. Returns the number that succeeded.
    pub async fn process_pending_attempts(&self, limit: i64) -> BillingResult<usize> {
        self.process_pending_attempts_until(limit, &CancellationToken::new())
            .await
    }

    pub async fn process_pending_attempts_until(
        &self,
        limit: i64,
        cancel: &CancellationToken,
    ) -> BillingResult<usize> {
        let now = self.clock.now();
        let pending = self.stores.attempts.get_pending_attempts(now, limit).await?;
        tracing::info!(pending = pending.len(), "Processing pending billing attempts");

        let mut succeeded = 0usize;
        for attempt in pending {
            if cancel.is_cancelled() {
                tracing::info!(succeeded = succeeded, "Pending attempt processing interrupted by shutdown");
                break;
            }

            match self.stores.attempts.claim_attempt(attempt.id, self.clock.now()).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::debug!(attempt_id = %attempt.id, "Attempt claimed elsewhere, skipping");
                    continue;
                }
                Err(e) => {
                    tracing::warn!(attempt_id = %attempt.id, error = %e, "Failed to claim billing attempt");
                    continue;
                }
            }

            match self.process_claimed(attempt).await {
                Ok(true) => succeeded += 1,
                Ok(false) => {}
                Err(e) => tracing::warn!(error = %e, "Failed to process billing attempt"),
            }
        }

        tracing::info!(succeeded = succeeded, "Pending attempt processing complete");
        Ok(succeeded)
    }

    /// Charge an attempt this processor has already claimed.
    async fn process_claimed(&self, mut attempt: BillingAttempt) -> BillingResult<bool> {
        attempt.mark_processing(self.clock.now());

        let sub = match self.stores.subscriptions.get_subscription(attempt.subscription_id).await {
            Ok(sub) => sub,
            Err(e) => {
                let message = if e.is_not_found() {
                    "subscription not found".to_string()
                } else {
                    format!("subscription lookup failed: {}", e)
                };
                return self.fail(attempt, message).await;
            }
        };

        if matches!(
            sub.status,
            SubscriptionStatus::Canceled | SubscriptionStatus::IncompleteExpired
        ) {
            return self
                .fail(attempt, format!("subscription is {}", sub.status))
                .await;
        }

        let card = match sub.card_id {
            Some(card_id) => self.stores.cards.get_card(card_id).await,
            None => Err(crate::error::BillingError::not_found("card", "none")),
        };
        let card = match card {
            Ok(card) => card,
            Err(e) if e.is_not_found() => return self.fail(attempt, "card not found".to_string()).await,
            Err(e) => return self.fail(attempt, format!("card lookup failed: {}", e)).await,
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

        let ChargeOutcome::Approved(resp) = outcome else {
            tracing::warn!(
                subscription_id = %sub.id,
                attempt_id = %attempt.id,
                attempt_number = attempt.attempt_number,
                error_code = attempt.error_code.as_deref().unwrap_or(""),
                "Billing attempt failed"
            );
            return Ok(false);
        };

        record_transaction(self.stores.transactions.as_ref(), &sub, &attempt, &resp, now).await;

        // Only an attempt for the outstanding cycle moves the period; other
        // out-of-band charges leave the schedule alone but still clear past_due.
        if attempt.period_start != sub.next_billing_at {
            match restore_after_payment(
                self.stores.subscriptions.as_ref(),
                self.stores.attempts.as_ref(),
                sub.id,
            )
            .await
            {
                Ok(Some(restored)) => tracing::info!(
                    subscription_id = %sub.id,
                    next_billing_at = %restored.next_billing_at,
                    "Subscription restored to active"
                ),
                Ok(None) => {}
                Err(e) => tracing::error!(
                    subscription_id = %sub.id,
                    attempt_id = %attempt.id,
                    error = %e,
                    "Charge succeeded but status was not restored - RECONCILIATION NEEDED"
                ),
            }
        } else {
            match settle_cycle(self.stores.subscriptions.as_ref(), sub.id, attempt.period_start).await {
                Ok(Some(advanced)) => tracing::info!(
                    subscription_id = %sub.id,
                    status = %advanced.status,
                    next_billing_at = %advanced.next_billing_at,
                    "Outstanding cycle settled"
                ),
                Ok(None) => {}
                Err(e) => tracing::error!(
                    subscription_id = %sub.id,
                    attempt_id = %attempt.id,
                    error = %e,
                    "Charge succeeded but period was not advanced - RECONCILIATION NEEDED"
                ),
            }
        }

        tracing::info!(
            subscription_id = %sub.id,
            attempt_id = %attempt.id,
            attempt_number = attempt.attempt_number,
            amount_cents = attempt.amount_cents,
            "Billing attempt succeeded"
        );
        Ok(true)
    }

    async fn fail(&self, mut attempt: BillingAttempt, message: String) -> BillingResult<bool> {
        tracing::warn!(
            subscription_id = %attempt.subscription_id,
            attempt_id = %attempt.id,
            reason = %message,
            "Billing attempt cannot be charged"
        );
        attempt.mark_failed(None, message, self.clock.now());
        self.stores.attempts.update_attempt(&attempt).await?;
        Ok(false)
    }
}
