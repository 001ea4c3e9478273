//! Subscription lifecycle
//!
//! Creation, cancellation and card swaps. These set the state the billing
//! cycle consumes; they never talk to the payment gateway themselves.

use std::collections::HashMap;
use std::sync::Arc;

use time::Duration;
use uuid::Uuid;

use crate::charge::mutate_subscription;
use crate::clock::Clock;
use crate::error::{BillingError, BillingResult};
use crate::models::{
    AttemptStatus, BillingAttempt, Subscription, SubscriptionStatus, Transaction, DEFAULT_CURRENCY,
};
use crate::store::BillingStores;

/// Input for [`SubscriptionService::create_subscription`].
#[derive(Debug, Clone)]
pub struct CreateSubscription {
    pub user_id: Uuid,
    pub plan_id: Uuid,
    pub card_id: Uuid,
    pub metadata: HashMap<String, String>,
}

/// Everything the engine has done for one subscription.
#[derive(Debug, Clone, serde::Serialize)]
pub struct BillingHistory {
    pub attempts: Vec<BillingAttempt>,
    pub transactions: Vec<Transaction>,
}

/// Subscription service for creating and managing subscriptions
pub struct SubscriptionService {
    stores: BillingStores,
    clock: Arc<dyn Clock>,
}

impl SubscriptionService {
    pub fn new(stores: BillingStores, clock: Arc<dyn Clock>) -> Self {
        Self { stores, clock }
    }

    /// Create a subscription from a plan.
    ///
    /// With a trial the subscription starts `trialing` and first bills at trial
    /// end. Without one it starts `active`, its first period is already open,
    /// and a pending attempt for that period is queued immediately.
    pub async fn create_subscription(&self, req: CreateSubscription) -> BillingResult<Subscription> {
        let plan = self.stores.plans.get_plan(req.plan_id).await?;
        if !plan.is_active {
            return Err(BillingError::Validation(format!("plan {} is not active", plan.id)));
        }

        let card = self.stores.cards.get_card(req.card_id).await?;
        if card.user_id != req.user_id {
            return Err(BillingError::Validation("card does not belong to user".to_string()));
        }

        let existing = self
            .stores
            .subscriptions
            .get_user_subscriptions(req.user_id, Some(SubscriptionStatus::Active))
            .await?;
        if existing.iter().any(|s| s.plan_id == Some(plan.id)) {
            return Err(BillingError::Validation(
                "user already has an active subscription for this plan".to_string(),
            ));
        }

        let now = self.clock.now();
        let currency = if plan.currency.trim().is_empty() {
            DEFAULT_CURRENCY.to_string()
        } else {
            plan.currency.clone()
        };

        let mut subscription = Subscription {
            id: Uuid::new_v4(),
            user_id: req.user_id,
            plan_id: Some(plan.id),
            card_id: Some(card.id),
            plan_name: plan.name.clone(),
            amount_cents: plan.amount_cents,
            currency,
            status: SubscriptionStatus::Active,
            interval: plan.interval,
            current_period_start: None,
            current_period_end: None,
            trial_start: None,
            trial_end: None,
            cancel_at_period_end: false,
            canceled_at: None,
            metadata: req.metadata,
            billing_cycle_anchor: None,
            next_billing_at: now,
            created_at: now,
            version: 0,
        };

        let has_trial = plan.trial_period_days > 0;
        if has_trial {
            let trial_end = now + Duration::days(i64::from(plan.trial_period_days));
            subscription.status = SubscriptionStatus::Trialing;
            subscription.trial_start = Some(now);
            subscription.trial_end = Some(trial_end);
            subscription.next_billing_at = trial_end;
        } else {
            subscription.current_period_start = Some(now);
            subscription.billing_cycle_anchor = Some(now);
            subscription.next_billing_at = plan.interval.advance(now);
            subscription.current_period_end = Some(subscription.next_billing_at);
        }

        self.stores.subscriptions.create_subscription(&subscription).await?;

        tracing::info!(
            subscription_id = %subscription.id,
            user_id = %subscription.user_id,
            plan = %subscription.plan_name,
            status = %subscription.status,
            next_billing_at = %subscription.next_billing_at,
            "Subscription created"
        );

        if !has_trial {
            let attempt = BillingAttempt::first_for_cycle(&subscription, now, AttemptStatus::Pending, now);
            if let Err(e) = self.stores.attempts.create_attempt(&attempt).await {
                tracing::warn!(
                    subscription_id = %subscription.id,
                    error = %e,
                    "Failed to create initial billing attempt"
                );
            }
        }

        Ok(subscription)
    }

    pub async fn get_subscription(&self, id: Uuid) -> BillingResult<Subscription> {
        self.stores.subscriptions.get_subscription(id).await
    }

    pub async fn get_user_subscriptions(
        &self,
        user_id: Uuid,
        status: Option<SubscriptionStatus>,
    ) -> BillingResult<Vec<Subscription>> {
        self.stores
            .subscriptions
            .get_user_subscriptions(user_id, status)
            .await
    }

    /// Cancel now (`canceled`) or at the end of the current period (flag only).
    pub async fn cancel_subscription(&self, id: Uuid, at_period_end: bool) -> BillingResult<Subscription> {
        let sub = self
            .stores
            .subscriptions
            .cancel_subscription(id, at_period_end, self.clock.now())
            .await?;

        tracing::info!(
            subscription_id = %id,
            at_period_end = at_period_end,
            status = %sub.status,
            "Subscription canceled"
        );
        Ok(sub)
    }

    /// Point the subscription at another of the subscriber's cards.
    pub async fn update_subscription_card(&self, id: Uuid, card_id: Uuid) -> BillingResult<Subscription> {
        let sub = self.stores.subscriptions.get_subscription(id).await?;
        let card = self.stores.cards.get_card(card_id).await?;
        if card.user_id != sub.user_id {
            return Err(BillingError::Validation("card does not belong to user".to_string()));
        }

        let updated = mutate_subscription(self.stores.subscriptions.as_ref(), id, |s| {
            if s.card_id == Some(card_id) {
                return false;
            }
            s.card_id = Some(card_id);
            true
        })
        .await?;

        tracing::info!(subscription_id = %id, card_id = %card_id, "Subscription card updated");
        match updated {
            Some(sub) => Ok(sub),
            None => self.stores.subscriptions.get_subscription(id).await,
        }
    }

    pub async fn subscription_billing_history(&self, id: Uuid) -> BillingResult<BillingHistory> {
        // Surface a missing subscription as NotFound rather than an empty history.
        self.stores.subscriptions.get_subscription(id).await?;
        let attempts = self.stores.attempts.get_subscription_attempts(id).await?;
        let transactions = self.stores.transactions.get_subscription_transactions(id).await?;
        Ok(BillingHistory {
            attempts,
            transactions,
        })
    }

    pub async fn count_active(&self) -> BillingResult<i64> {
        self.stores.subscriptions.count_active().await
    }
}
