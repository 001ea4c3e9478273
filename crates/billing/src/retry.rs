//! Retry policy for failed billing attempts
//!
//! [`RetryPolicy`] is the pure backoff schedule. [`RetryService`] applies it
//! to failed attempts in the store, queueing the next pending attempt for the
//! same cycle, and closes out cycles whose retries are exhausted.

use std::sync::Arc;

use time::{Duration, OffsetDateTime};

use crate::charge::{mark_past_due, mutate_subscription};
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::error::BillingResult;
use crate::models::{is_permanent_decline, AttemptStatus, BillingAttempt, SubscriptionStatus};
use crate::store::BillingStores;

/// What the policy says about one failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Queue the next ordinal after this delay from the failure.
    RetryAfter(Duration),
    /// Permanent decline code; never retried.
    Permanent,
    /// Ordinal past the schedule or the configured maximum.
    Exhausted,
}

/// Backoff schedule keyed by the failed attempt's ordinal.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    max_attempts: i32,
}

impl RetryPolicy {
    pub fn new(max_attempts: i32) -> Self {
        Self { max_attempts }
    }

    /// 1 -> immediately, 2 -> 72h, 3 -> 168h, anything else -> none.
    pub fn delay_for(ordinal: i32) -> Option<Duration> {
        match ordinal {
            1 => Some(Duration::ZERO),
            2 => Some(Duration::hours(72)),
            3 => Some(Duration::hours(168)),
            _ => None,
        }
    }

    pub fn decide(&self, ordinal: i32, error_code: Option<&str>) -> RetryDecision {
        if is_permanent_decline(error_code) {
            return RetryDecision::Permanent;
        }
        if ordinal >= self.max_attempts {
            return RetryDecision::Exhausted;
        }
        match Self::delay_for(ordinal) {
            Some(delay) => RetryDecision::RetryAfter(delay),
            None => RetryDecision::Exhausted,
        }
    }

    /// When the retry of `failed` becomes due. Never earlier than `now`.
    pub fn retry_at(failed: &BillingAttempt, delay: Duration, now: OffsetDateTime) -> OffsetDateTime {
        let anchor = failed.processed_at.unwrap_or(now);
        (anchor + delay).max(now)
    }
}

pub struct RetryService {
    stores: BillingStores,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
}

impl RetryService {
    pub fn new(stores: BillingStores, clock: Arc<dyn Clock>, config: EngineConfig) -> Self {
        Self {
            stores,
            clock,
            config,
        }
    }

    /// Queue retries for failed attempts past the cooldown. Returns the number
    /// of new attempts created.
    pub async fn retry_failed_billing(&self, max_attempts: i32) -> BillingResult<usize> {
        let now = self.clock.now();
        let older_than = now - self.config.retry_cooldown();
        let policy = RetryPolicy::new(max_attempts);

        let failed = self
            .stores
            .attempts
            .get_failed_for_retry(max_attempts, older_than, self.config.retry_scan_limit)
            .await?;
        tracing::info!(candidates = failed.len(), "Scanning failed billing attempts for retry");

        let mut created = 0usize;
        for attempt in failed {
            match self.retry_one(&policy, &attempt, now).await {
                Ok(true) => created += 1,
                Ok(false) => {}
                Err(e) => tracing::warn!(
                    attempt_id = %attempt.id,
                    subscription_id = %attempt.subscription_id,
                    error = %e,
                    "Failed to schedule retry"
                ),
            }
        }

        tracing::info!(created = created, "Retry scheduling complete");
        Ok(created)
    }

    async fn retry_one(&self, policy: &RetryPolicy, failed: &BillingAttempt, now: OffsetDateTime) -> BillingResult<bool> {
        let RetryDecision::RetryAfter(delay) = policy.decide(failed.attempt_number, failed.error_code.as_deref()) else {
            return Ok(false);
        };

        let sub = self.stores.subscriptions.get_subscription(failed.subscription_id).await?;
        if !sub.status.is_retryable() {
            tracing::debug!(
                subscription_id = %sub.id,
                status = %sub.status,
                "Subscription no longer billable, not retrying"
            );
            return Ok(false);
        }

        if !self.stores.attempts.mark_superseded(failed.id, now).await? {
            return Ok(false);
        }

        let retry = BillingAttempt::retry_of(failed, RetryPolicy::retry_at(failed, delay, now), now);
        match self.stores.attempts.create_attempt(&retry).await {
            Ok(()) => {}
            Err(e) if e.is_conflict() => {
                tracing::debug!(attempt_id = %failed.id, "Retry already exists for this cycle");
                return Ok(false);
            }
            Err(e) => return Err(e),
        }

        if failed.attempt_number == 1 && mark_past_due(self.stores.subscriptions.as_ref(), sub.id).await? {
            tracing::info!(subscription_id = %sub.id, "Subscription moved to past_due");
        }

        tracing::info!(
            subscription_id = %sub.id,
            failed_attempt_id = %failed.id,
            attempt_id = %retry.id,
            attempt_number = retry.attempt_number,
            scheduled_at = %retry.scheduled_at,
            "Retry scheduled"
        );
        Ok(true)
    }

    /// Close out failures that can no longer be retried. With
    /// `mark_unpaid_after_retries` the subscription moves to `unpaid`.
    /// Returns the number of subscriptions moved.
    pub async fn close_out_exhausted(&self, max_attempts: i32) -> BillingResult<usize> {
        let now = self.clock.now();
        let older_than = now - self.config.retry_cooldown();
        let exhausted = self
            .stores
            .attempts
            .get_exhausted_failures(max_attempts, older_than, self.config.retry_scan_limit)
            .await?;

        let mut moved = 0usize;
        for attempt in exhausted {
            match self.close_out_one(&attempt, now).await {
                Ok(true) => moved += 1,
                Ok(false) => {}
                Err(e) => tracing::warn!(
                    attempt_id = %attempt.id,
                    subscription_id = %attempt.subscription_id,
                    error = %e,
                    "Failed to close out exhausted attempt"
                ),
            }
        }

        if moved > 0 {
            tracing::info!(moved = moved, "Subscriptions marked unpaid after exhausting retries");
        }
        Ok(moved)
    }

    async fn close_out_one(&self, attempt: &BillingAttempt, now: OffsetDateTime) -> BillingResult<bool> {
        if !self.stores.attempts.mark_superseded(attempt.id, now).await? {
            return Ok(false);
        }
        if !self.config.mark_unpaid_after_retries {
            return Ok(false);
        }

        // A payment for this period or a later one means the debt was settled.
        let settled = self
            .stores
            .attempts
            .get_subscription_attempts(attempt.subscription_id)
            .await?
            .iter()
            .any(|a| a.status == AttemptStatus::Succeeded && a.period_start >= attempt.period_start);
        if settled {
            return Ok(false);
        }

        let changed = mutate_subscription(self.stores.subscriptions.as_ref(), attempt.subscription_id, |sub| {
            if !sub.status.is_retryable() {
                return false;
            }
            sub.status = SubscriptionStatus::Unpaid;
            true
        })
        .await?;

        if changed.is_some() {
            tracing::warn!(
                subscription_id = %attempt.subscription_id,
                attempt_id = %attempt.id,
                attempt_number = attempt.attempt_number,
                error_code = attempt.error_code.as_deref().unwrap_or(""),
                "Retries exhausted, subscription marked unpaid"
            );
        }
        Ok(changed.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::BillingAttemptStore;
    use crate::testing::Fixture;
    use time::macros::datetime;

    // =========================================================================
    // Policy
    // =========================================================================

    #[test]
    fn test_backoff_schedule() {
        assert_eq!(RetryPolicy::delay_for(1), Some(Duration::ZERO));
        assert_eq!(RetryPolicy::delay_for(2), Some(Duration::hours(72)));
        assert_eq!(RetryPolicy::delay_for(3), Some(Duration::hours(168)));
        assert_eq!(RetryPolicy::delay_for(4), None);
        assert_eq!(RetryPolicy::delay_for(0), None);
    }

    #[test]
    fn test_decide() {
        let policy = RetryPolicy::new(4);
        assert_eq!(policy.decide(1, Some("declined")), RetryDecision::RetryAfter(Duration::ZERO));
        assert_eq!(policy.decide(3, None), RetryDecision::RetryAfter(Duration::hours(168)));
        assert_eq!(policy.decide(4, None), RetryDecision::Exhausted);
        assert_eq!(policy.decide(1, Some("insufficient_funds")), RetryDecision::Permanent);

        let capped = RetryPolicy::new(2);
        assert_eq!(capped.decide(2, None), RetryDecision::Exhausted);
    }

    #[test]
    fn test_retry_at_never_in_the_past() {
        let now = datetime!(2025-05-10 00:00 UTC);
        let fx = Fixture::new(now);
        let sub = fx.active_subscription(now);
        let mut failed = BillingAttempt::first_for_cycle(&sub, now, AttemptStatus::Failed, now);
        failed.processed_at = Some(now - Duration::days(5));

        assert_eq!(RetryPolicy::retry_at(&failed, Duration::hours(72), now), now);
        assert_eq!(
            RetryPolicy::retry_at(&failed, Duration::hours(168), now),
            now - Duration::days(5) + Duration::hours(168)
        );
    }

    // =========================================================================
    // Service
    // =========================================================================

    fn failed_attempt(fx: &Fixture, sub: &crate::models::Subscription, ordinal: i32, code: Option<&str>, age: Duration) -> BillingAttempt {
        let mut attempt = BillingAttempt::first_for_cycle(sub, sub.next_billing_at, AttemptStatus::Failed, fx.now());
        attempt.attempt_number = ordinal;
        attempt.error_code = code.map(str::to_string);
        attempt.error_message = Some("payment declined".to_string());
        attempt.processed_at = Some(fx.now() - age);
        fx.store.put_attempt(attempt.clone()).unwrap();
        attempt
    }

    #[tokio::test]
    async fn test_first_failure_retries_now_and_marks_past_due() {
        let fx = Fixture::new(datetime!(2025-05-10 00:00 UTC));
        let sub = fx.active_subscription(fx.now() - Duration::days(2));
        let failed = failed_attempt(&fx, &sub, 1, Some("declined"), Duration::hours(25));

        assert_eq!(fx.retry_service().retry_failed_billing(3).await.unwrap(), 1);

        let attempts = fx.store.get_cycle_attempts(sub.id, sub.next_billing_at).await.unwrap();
        let retry = attempts.iter().find(|a| a.attempt_number == 2).unwrap();
        assert_eq!(retry.status, AttemptStatus::Pending);
        assert_eq!(retry.scheduled_at, fx.now());
        assert_eq!(retry.amount_cents, failed.amount_cents);

        assert_eq!(fx.subscription(sub.id).await.status, SubscriptionStatus::PastDue);
        assert!(fx.store.get_attempt(failed.id).await.unwrap().superseded_at.is_some());
    }

    #[tokio::test]
    async fn test_second_failure_waits_72_hours() {
        let fx = Fixture::new(datetime!(2025-05-10 00:00 UTC));
        let sub = fx.subscription_with(SubscriptionStatus::PastDue, fx.now() - Duration::days(3));
        let failed = failed_attempt(&fx, &sub, 2, Some("declined"), Duration::hours(30));

        assert_eq!(fx.retry_service().retry_failed_billing(4).await.unwrap(), 1);

        let attempts = fx.store.get_cycle_attempts(sub.id, sub.next_billing_at).await.unwrap();
        let retry = attempts.iter().find(|a| a.attempt_number == 3).unwrap();
        assert_eq!(retry.scheduled_at, failed.processed_at.unwrap() + Duration::hours(72));
    }

    #[tokio::test]
    async fn test_cooldown_permanent_and_max_are_respected() {
        let fx = Fixture::new(datetime!(2025-05-10 00:00 UTC));
        let fresh = fx.active_subscription(fx.now());
        failed_attempt(&fx, &fresh, 1, Some("declined"), Duration::hours(2));
        let permanent = fx.active_subscription(fx.now());
        failed_attempt(&fx, &permanent, 1, Some("card_declined"), Duration::days(2));
        let maxed = fx.subscription_with(SubscriptionStatus::PastDue, fx.now());
        failed_attempt(&fx, &maxed, 3, None, Duration::days(2));

        assert_eq!(fx.retry_service().retry_failed_billing(3).await.unwrap(), 0);
        assert_eq!(fx.store.all_attempts().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_canceled_subscription_is_not_retried() {
        let fx = Fixture::new(datetime!(2025-05-10 00:00 UTC));
        let sub = fx.subscription_with(SubscriptionStatus::Canceled, fx.now());
        failed_attempt(&fx, &sub, 1, None, Duration::days(2));

        assert_eq!(fx.retry_service().retry_failed_billing(3).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_second_scan_does_not_duplicate() {
        let fx = Fixture::new(datetime!(2025-05-10 00:00 UTC));
        let sub = fx.active_subscription(fx.now());
        failed_attempt(&fx, &sub, 1, None, Duration::days(2));
        let service = fx.retry_service();

        assert_eq!(service.retry_failed_billing(3).await.unwrap(), 1);
        assert_eq!(service.retry_failed_billing(3).await.unwrap(), 0);
        assert_eq!(fx.store.all_attempts().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_exhausted_cycle_marks_unpaid() {
        let fx = Fixture::new(datetime!(2025-05-10 00:00 UTC));
        let sub = fx.subscription_with(SubscriptionStatus::PastDue, fx.now() - Duration::days(10));
        failed_attempt(&fx, &sub, 3, Some("declined"), Duration::days(2));
        let service = fx.retry_service();

        assert_eq!(service.close_out_exhausted(3).await.unwrap(), 1);
        assert_eq!(fx.subscription(sub.id).await.status, SubscriptionStatus::Unpaid);
        assert_eq!(service.close_out_exhausted(3).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_permanent_decline_closes_out_immediately_after_cooldown() {
        let fx = Fixture::new(datetime!(2025-05-10 00:00 UTC));
        let sub = fx.active_subscription(fx.now() - Duration::days(2));
        failed_attempt(&fx, &sub, 1, Some("invalid_card"), Duration::days(2));

        assert_eq!(fx.retry_service().close_out_exhausted(3).await.unwrap(), 1);
        assert_eq!(fx.subscription(sub.id).await.status, SubscriptionStatus::Unpaid);
    }

    #[tokio::test]
    async fn test_exhausted_creation_charge_marks_unpaid() {
        let fx = Fixture::new(datetime!(2025-05-10 00:00 UTC));
        let sub = fx.subscription_with(SubscriptionStatus::PastDue, fx.now() + Duration::days(20));
        let mut failed = failed_attempt(&fx, &sub, 3, Some("declined"), Duration::days(2));
        failed.period_start = sub.created_at;
        fx.store.put_attempt(failed).unwrap();

        assert_eq!(fx.retry_service().close_out_exhausted(3).await.unwrap(), 1);
        assert_eq!(fx.subscription(sub.id).await.status, SubscriptionStatus::Unpaid);
    }

    #[tokio::test]
    async fn test_paid_later_cycle_is_not_closed_out() {
        let fx = Fixture::new(datetime!(2025-05-10 00:00 UTC));
        let sub = fx.active_subscription(fx.now() + Duration::days(20));
        let mut failed = failed_attempt(&fx, &sub, 3, Some("declined"), Duration::days(2));
        failed.period_start = sub.created_at - Duration::days(30);
        fx.store.put_attempt(failed).unwrap();
        let mut paid = BillingAttempt::first_for_cycle(&sub, sub.created_at, AttemptStatus::Succeeded, fx.now());
        paid.processed_at = Some(fx.now() - Duration::days(1));
        fx.store.put_attempt(paid).unwrap();

        assert_eq!(fx.retry_service().close_out_exhausted(3).await.unwrap(), 0);
        assert_eq!(fx.subscription(sub.id).await.status, SubscriptionStatus::Active);
    }

    #[tokio::test]
    async fn test_close_out_can_be_disabled() {
        let mut fx = Fixture::new(datetime!(2025-05-10 00:00 UTC));
        fx.config.mark_unpaid_after_retries = false;
        let sub = fx.subscription_with(SubscriptionStatus::PastDue, fx.now());
        let failed = failed_attempt(&fx, &sub, 3, None, Duration::days(2));

        assert_eq!(fx.retry_service().close_out_exhausted(3).await.unwrap(), 0);
        assert_eq!(fx.subscription(sub.id).await.status, SubscriptionStatus::PastDue);
        assert!(fx.store.get_attempt(failed.id).await.unwrap().superseded_at.is_some());
    }
}
