// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for the Billing Engine
//!
//! End-to-end scenarios across processors:
//! - Due cycles (one attempt per cycle, calendar advance, duplicate passes)
//! - Retry schedule (backoff timing, permanent declines, exhaustion)
//! - Subscription lifecycle (trial, no trial, recovery from past_due)
//! - Partial failures (lost transaction writes, lost period advances)

#[cfg(test)]
mod due_cycle_tests {
    use crate::due::DueOutcome;
    use crate::models::{AttemptStatus, BillingAttempt, BillingInterval, SubscriptionStatus};
    use crate::store::{BillingAttemptStore, TransactionStore};
    use crate::subscriptions::CreateSubscription;
    use crate::testing::{card_for, plan, Fixture};
    use std::collections::HashMap;
    use time::macros::datetime;
    use time::Duration;
    use uuid::Uuid;

    // =========================================================================
    // Every eligible subscription gets exactly one ordinal-1 attempt
    // =========================================================================
    #[tokio::test]
    async fn test_one_first_attempt_per_due_subscription() {
        let fx = Fixture::new(datetime!(2025-03-01 06:00 UTC));
        let now = fx.now();
        let due = vec![
            fx.active_subscription(now - Duration::days(3)),
            fx.active_subscription(now),
            fx.active_subscription(now + Duration::minutes(5)),
        ];
        let mut trialing = fx.subscription_with(SubscriptionStatus::Trialing, now - Duration::hours(1));
        trialing.trial_end = Some(now - Duration::hours(1));
        fx.store.put_subscription(trialing.clone()).unwrap();

        let processor = fx.subscription_processor();
        let (a, b) = tokio::join!(
            processor.process_due_subscriptions(100),
            processor.process_due_subscriptions(100)
        );
        assert_eq!(a.unwrap() + b.unwrap(), 4);

        for sub in due.iter().chain(std::iter::once(&trialing)) {
            let attempts = fx.store.get_subscription_attempts(sub.id).await.unwrap();
            assert_eq!(attempts.len(), 1, "subscription {} billed more than once", sub.id);
            assert_eq!(attempts[0].attempt_number, 1);
            assert_eq!(attempts[0].period_start, sub.next_billing_at);
        }
        assert_eq!(fx.gateway.charge_count(), 4);
    }

    // =========================================================================
    // A paid cycle is never attempted again
    // =========================================================================
    #[tokio::test]
    async fn test_stale_copy_of_paid_cycle_is_not_recharged() {
        let fx = Fixture::new(datetime!(2025-03-01 06:00 UTC));
        let sub = fx.active_subscription(fx.now());
        let processor = fx.subscription_processor();

        assert_eq!(processor.process_subscription(&sub).await.unwrap(), DueOutcome::Charged);
        // A second pass that read the subscription before the first one saved it.
        assert_eq!(processor.process_subscription(&sub).await.unwrap(), DueOutcome::Repaired);

        assert_eq!(fx.gateway.charge_count(), 1);
        assert_eq!(fx.store.get_subscription_attempts(sub.id).await.unwrap().len(), 1);

        // Nothing else in a full cycle adds to the paid period either.
        fx.clock.advance(Duration::days(2));
        fx.engine().run_cycle(&Default::default()).await;
        let cycle = fx.store.get_cycle_attempts(sub.id, sub.next_billing_at).await.unwrap();
        assert_eq!(cycle.len(), 1);
        assert_eq!(cycle[0].status, AttemptStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_in_flight_cycle_is_left_alone() {
        let fx = Fixture::new(datetime!(2025-03-01 06:00 UTC));
        let sub = fx.active_subscription(fx.now());
        let in_flight = BillingAttempt::first_for_cycle(&sub, sub.next_billing_at, AttemptStatus::Processing, fx.now());
        fx.store.put_attempt(in_flight).unwrap();

        let outcome = fx.subscription_processor().process_subscription(&sub).await.unwrap();
        assert_eq!(outcome, DueOutcome::AlreadyAttempted);
        assert_eq!(fx.gateway.charge_count(), 0);
        assert_eq!(fx.subscription(sub.id).await.next_billing_at, sub.next_billing_at);
    }

    // =========================================================================
    // 1000 LKR monthly: one charge moves the period one calendar month
    // =========================================================================
    #[tokio::test]
    async fn test_monthly_round_trip() {
        let fx = Fixture::new(datetime!(2025-03-15 10:00 UTC));
        let plan = fx.add_plan(plan(100_000, BillingInterval::Month, 0));
        let user = Uuid::new_v4();
        let card = fx.add_card(card_for(user));
        let sub = fx
            .subscription_service()
            .create_subscription(CreateSubscription {
                user_id: user,
                plan_id: plan.id,
                card_id: card.id,
                metadata: HashMap::new(),
            })
            .await
            .unwrap();

        let d = sub.next_billing_at;
        assert_eq!(d, datetime!(2025-04-15 10:00 UTC));
        fx.clock.set(d);

        assert_eq!(fx.subscription_processor().process_due_subscriptions(100).await.unwrap(), 1);

        let after = fx.subscription(sub.id).await;
        assert_eq!(after.next_billing_at, datetime!(2025-05-15 10:00 UTC));
        assert_eq!(after.current_period_start, Some(d));

        let cycle = fx.store.get_cycle_attempts(sub.id, d).await.unwrap();
        assert_eq!(cycle.len(), 1);
        let txns = fx.store.get_subscription_transactions(sub.id).await.unwrap();
        assert_eq!(txns.len(), 1);
        assert_eq!(txns[0].billing_attempt_id, Some(cycle[0].id));
        assert_eq!(txns[0].amount_cents, 100_000);
        assert_eq!(txns[0].currency, "LKR");
    }

    #[tokio::test]
    async fn test_leap_day_yearly_advance_clamps() {
        let fx = Fixture::new(datetime!(2024-02-29 00:00 UTC));
        let mut sub = fx.active_subscription(fx.now());
        sub.interval = BillingInterval::Year;
        fx.store.put_subscription(sub.clone()).unwrap();

        fx.subscription_processor().process_due_subscriptions(100).await.unwrap();
        assert_eq!(
            fx.subscription(sub.id).await.next_billing_at,
            datetime!(2025-02-28 00:00 UTC)
        );
    }
}

#[cfg(test)]
mod retry_schedule_tests {
    use crate::gateway::ScriptedOutcome;
    use crate::models::{AttemptStatus, BillingAttempt, Subscription, SubscriptionStatus, PERMANENT_DECLINE_CODES};
    use crate::store::BillingAttemptStore;
    use crate::testing::Fixture;
    use time::macros::datetime;
    use time::Duration;

    async fn ordinal(fx: &Fixture, sub: &Subscription, n: i32) -> BillingAttempt {
        fx.store
            .get_cycle_attempts(sub.id, sub.next_billing_at)
            .await
            .unwrap()
            .into_iter()
            .find(|a| a.attempt_number == n)
            .unwrap_or_else(|| panic!("no attempt {} for cycle", n))
    }

    // =========================================================================
    // Backoff: 1 -> now, 2 -> +72h, 3 -> +168h, 4 -> none
    // =========================================================================
    #[tokio::test]
    async fn test_backoff_schedule_end_to_end() {
        let mut fx = Fixture::new(datetime!(2025-09-01 00:00 UTC));
        fx.config.max_retry_attempts = 4;
        let sub = fx.active_subscription(fx.now());
        for _ in 0..4 {
            fx.gateway.push(ScriptedOutcome::decline("DECLINED"));
        }
        let due = fx.subscription_processor();
        let pending = fx.pending_processor();
        let retry = fx.retry_service();

        due.process_due_subscriptions(100).await.unwrap();
        assert_eq!(fx.subscription(sub.id).await.status, SubscriptionStatus::PastDue);

        // Ordinal 1 failed: retry is due as soon as the cooldown lets us see it.
        fx.clock.advance(Duration::hours(25));
        assert_eq!(retry.retry_failed_billing(4).await.unwrap(), 1);
        assert_eq!(ordinal(&fx, &sub, 2).await.scheduled_at, fx.now());

        assert_eq!(pending.process_pending_attempts(50).await.unwrap(), 0);
        let second = ordinal(&fx, &sub, 2).await;
        assert_eq!(second.status, AttemptStatus::Failed);

        fx.clock.advance(Duration::hours(25));
        assert_eq!(retry.retry_failed_billing(4).await.unwrap(), 1);
        let third = ordinal(&fx, &sub, 3).await;
        assert_eq!(third.scheduled_at, second.processed_at.unwrap() + Duration::hours(72));

        // Not yet due.
        assert_eq!(pending.process_pending_attempts(50).await.unwrap(), 0);
        assert_eq!(fx.gateway.charge_count(), 2);

        fx.clock.set(third.scheduled_at);
        pending.process_pending_attempts(50).await.unwrap();
        let third = ordinal(&fx, &sub, 3).await;
        assert_eq!(third.status, AttemptStatus::Failed);

        fx.clock.advance(Duration::hours(25));
        assert_eq!(retry.retry_failed_billing(4).await.unwrap(), 1);
        let fourth = ordinal(&fx, &sub, 4).await;
        assert_eq!(fourth.scheduled_at, third.processed_at.unwrap() + Duration::hours(168));

        fx.clock.set(fourth.scheduled_at);
        pending.process_pending_attempts(50).await.unwrap();
        fx.clock.advance(Duration::hours(25));
        assert_eq!(retry.retry_failed_billing(10).await.unwrap(), 0);

        // Nothing left to try: the subscription is closed out.
        assert_eq!(retry.close_out_exhausted(4).await.unwrap(), 1);
        assert_eq!(fx.subscription(sub.id).await.status, SubscriptionStatus::Unpaid);
        assert_eq!(fx.gateway.charge_count(), 4);
    }

    // =========================================================================
    // Permanent declines are never retried, whatever the ordinal
    // =========================================================================
    #[tokio::test]
    async fn test_permanent_declines_never_retry() {
        let fx = Fixture::new(datetime!(2025-09-01 00:00 UTC));
        for code in PERMANENT_DECLINE_CODES {
            for n in 1..=3 {
                let sub = fx.subscription_with(SubscriptionStatus::PastDue, fx.now());
                let mut failed = BillingAttempt::first_for_cycle(&sub, sub.next_billing_at, AttemptStatus::Failed, fx.now());
                failed.attempt_number = n;
                failed.error_code = Some(code.to_string());
                failed.processed_at = Some(fx.now() - Duration::days(30));
                fx.store.put_attempt(failed).unwrap();
            }
        }

        assert_eq!(fx.retry_service().retry_failed_billing(10).await.unwrap(), 0);
        assert!(fx
            .store
            .all_attempts()
            .unwrap()
            .iter()
            .all(|a| a.status == AttemptStatus::Failed));
    }

    #[tokio::test]
    async fn test_upper_case_permanent_code_is_final() {
        let fx = Fixture::new(datetime!(2025-09-01 00:00 UTC));
        let sub = fx.active_subscription(fx.now());
        fx.gateway.push(ScriptedOutcome::decline("INSUFFICIENT_FUNDS"));

        fx.subscription_processor().process_due_subscriptions(100).await.unwrap();
        fx.clock.advance(Duration::days(2));

        let retry = fx.retry_service();
        assert_eq!(retry.retry_failed_billing(3).await.unwrap(), 0);
        assert_eq!(retry.close_out_exhausted(3).await.unwrap(), 1);
        assert_eq!(fx.subscription(sub.id).await.status, SubscriptionStatus::Unpaid);
    }

    #[tokio::test]
    async fn test_failure_inside_cooldown_waits_for_next_cycle() {
        let fx = Fixture::new(datetime!(2025-09-01 00:00 UTC));
        let sub = fx.active_subscription(fx.now());
        fx.gateway.push(ScriptedOutcome::decline("DECLINED"));

        let report = fx.engine().run_cycle(&Default::default()).await;
        assert_eq!(report.task(crate::engine::TASK_RETRIES).unwrap().processed, 0);
        assert_eq!(fx.store.get_subscription_attempts(sub.id).await.unwrap().len(), 1);
    }
}

#[cfg(test)]
mod lifecycle_tests {
    use crate::gateway::ScriptedOutcome;
    use crate::models::{AttemptStatus, BillingAttempt, BillingInterval, SubscriptionStatus};
    use crate::subscriptions::CreateSubscription;
    use crate::testing::{card_for, plan, Fixture};
    use std::collections::HashMap;
    use time::macros::datetime;
    use time::Duration;
    use uuid::Uuid;

    fn request(user_id: Uuid, plan_id: Uuid, card_id: Uuid) -> CreateSubscription {
        CreateSubscription {
            user_id,
            plan_id,
            card_id,
            metadata: HashMap::new(),
        }
    }

    // =========================================================================
    // Trial: no charge until trial end, then normal billing
    // =========================================================================
    #[tokio::test]
    async fn test_trial_subscription_first_bills_at_trial_end() {
        let fx = Fixture::new(datetime!(2025-10-01 00:00 UTC));
        let plan = fx.add_plan(plan(100_000, BillingInterval::Month, 14));
        let user = Uuid::new_v4();
        let card = fx.add_card(card_for(user));
        let sub = fx
            .subscription_service()
            .create_subscription(request(user, plan.id, card.id))
            .await
            .unwrap();
        assert_eq!(sub.trial_end, Some(sub.created_at + Duration::days(14)));
        assert!(fx.store.all_attempts().unwrap().is_empty());

        fx.clock.advance(Duration::days(13));
        fx.engine().run_cycle(&Default::default()).await;
        assert_eq!(fx.gateway.charge_count(), 0);

        fx.clock.advance(Duration::days(1));
        fx.engine().run_cycle(&Default::default()).await;
        let after = fx.subscription(sub.id).await;
        assert_eq!(fx.gateway.charge_count(), 1);
        assert_eq!(after.status, SubscriptionStatus::Active);
        assert_eq!(after.next_billing_at, datetime!(2025-11-15 00:00 UTC));
    }

    // =========================================================================
    // No trial: first charge is queued and taken without moving the schedule
    // =========================================================================
    #[tokio::test]
    async fn test_initial_charge_does_not_shift_schedule() {
        let fx = Fixture::new(datetime!(2025-10-01 00:00 UTC));
        let plan = fx.add_plan(plan(100_000, BillingInterval::Month, 0));
        let user = Uuid::new_v4();
        let card = fx.add_card(card_for(user));
        let sub = fx
            .subscription_service()
            .create_subscription(request(user, plan.id, card.id))
            .await
            .unwrap();

        let attempts = fx.store.all_attempts().unwrap();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].status, AttemptStatus::Pending);
        assert_eq!(attempts[0].scheduled_at, sub.created_at);

        let report = fx.engine().run_cycle(&Default::default()).await;
        assert_eq!(report.task(crate::engine::TASK_PENDING_ATTEMPTS).unwrap().processed, 1);

        let after = fx.subscription(sub.id).await;
        assert_eq!(after.next_billing_at, datetime!(2025-11-01 00:00 UTC));
        assert_eq!(after.status, SubscriptionStatus::Active);
    }

    // =========================================================================
    // Declined first charge, paid on retry, then renewed on schedule
    // =========================================================================
    #[tokio::test]
    async fn test_initial_charge_retry_recovers_and_renews() {
        let fx = Fixture::new(datetime!(2025-10-01 00:00 UTC));
        let plan = fx.add_plan(plan(100_000, BillingInterval::Month, 0));
        let user = Uuid::new_v4();
        let card = fx.add_card(card_for(user));
        let sub = fx
            .subscription_service()
            .create_subscription(request(user, plan.id, card.id))
            .await
            .unwrap();
        let engine = fx.engine();

        fx.gateway.push(ScriptedOutcome::decline("DECLINED"));
        engine.run_cycle(&Default::default()).await;
        assert_eq!(fx.gateway.charge_count(), 1);

        // Past the cooldown: the retry is queued, the subscription goes past_due,
        // and the following cycle charges the retry.
        fx.clock.advance(Duration::hours(25));
        engine.run_cycle(&Default::default()).await;
        assert_eq!(fx.subscription(sub.id).await.status, SubscriptionStatus::PastDue);
        engine.run_cycle(&Default::default()).await;
        assert_eq!(fx.gateway.charge_count(), 2);

        let paid = fx.subscription(sub.id).await;
        assert_eq!(paid.status, SubscriptionStatus::Active);
        assert_eq!(paid.next_billing_at, datetime!(2025-11-01 00:00 UTC));

        fx.clock.set(datetime!(2025-11-01 01:00 UTC));
        engine.run_cycle(&Default::default()).await;
        assert_eq!(fx.gateway.charge_count(), 3);

        let renewed = fx.subscription(sub.id).await;
        assert_eq!(renewed.status, SubscriptionStatus::Active);
        assert_eq!(renewed.current_period_start, Some(datetime!(2025-11-01 00:00 UTC)));
        assert_eq!(renewed.next_billing_at, datetime!(2025-12-01 00:00 UTC));
    }

    // =========================================================================
    // A creation-time charge that never goes through ends in unpaid
    // =========================================================================
    #[tokio::test]
    async fn test_exhausted_initial_charge_ends_unpaid() {
        let fx = Fixture::new(datetime!(2025-10-01 00:00 UTC));
        let plan = fx.add_plan(plan(100_000, BillingInterval::Month, 0));
        let user = Uuid::new_v4();
        let card = fx.add_card(card_for(user));
        let sub = fx
            .subscription_service()
            .create_subscription(request(user, plan.id, card.id))
            .await
            .unwrap();

        fx.gateway.push(ScriptedOutcome::decline("CARD_DECLINED"));
        fx.engine().run_cycle(&Default::default()).await;

        fx.clock.advance(Duration::hours(25));
        fx.engine().run_cycle(&Default::default()).await;
        assert_eq!(fx.subscription(sub.id).await.status, SubscriptionStatus::Unpaid);
        assert_eq!(fx.gateway.charge_count(), 1);
    }

    // =========================================================================
    // past_due -> active in the same write that advances the period
    // =========================================================================
    #[tokio::test]
    async fn test_recovery_restores_active_in_one_update() {
        let fx = Fixture::new(datetime!(2025-10-05 00:00 UTC));
        let sub = fx.subscription_with(SubscriptionStatus::PastDue, datetime!(2025-10-01 00:00 UTC));
        let mut retry = BillingAttempt::first_for_cycle(&sub, sub.next_billing_at, AttemptStatus::Pending, fx.now());
        retry.attempt_number = 2;
        fx.store.put_attempt(retry).unwrap();

        fx.pending_processor().process_pending_attempts(50).await.unwrap();

        let after = fx.subscription(sub.id).await;
        assert_eq!(after.status, SubscriptionStatus::Active);
        assert_eq!(after.next_billing_at, datetime!(2025-11-01 00:00 UTC));
        assert_eq!(after.version, sub.version + 1);
    }

    #[tokio::test]
    async fn test_unpaid_subscription_recovers_on_payment() {
        let fx = Fixture::new(datetime!(2025-10-05 00:00 UTC));
        let sub = fx.subscription_with(SubscriptionStatus::Unpaid, datetime!(2025-10-01 00:00 UTC));
        let mut manual = BillingAttempt::first_for_cycle(&sub, sub.next_billing_at, AttemptStatus::Pending, fx.now());
        manual.attempt_number = 5;
        fx.store.put_attempt(manual).unwrap();

        fx.pending_processor().process_pending_attempts(50).await.unwrap();
        assert_eq!(fx.subscription(sub.id).await.status, SubscriptionStatus::Active);
    }

    #[tokio::test]
    async fn test_canceled_subscription_is_never_billed() {
        let fx = Fixture::new(datetime!(2025-10-05 00:00 UTC));
        let sub = fx.active_subscription(fx.now());
        fx.subscription_service().cancel_subscription(sub.id, false).await.unwrap();
        fx.gateway.push(ScriptedOutcome::Approve);

        fx.engine().run_cycle(&Default::default()).await;
        assert_eq!(fx.gateway.charge_count(), 0);
        assert_eq!(fx.subscription(sub.id).await.status, SubscriptionStatus::Canceled);
    }

    #[tokio::test]
    async fn test_cancel_at_period_end_stops_billing() {
        let fx = Fixture::new(datetime!(2025-10-05 00:00 UTC));
        let sub = fx.active_subscription(fx.now() + Duration::days(1));
        let updated = fx.subscription_service().cancel_subscription(sub.id, true).await.unwrap();
        assert_eq!(updated.status, SubscriptionStatus::Active);
        assert!(updated.cancel_at_period_end);

        fx.clock.advance(Duration::days(2));
        fx.engine().run_cycle(&Default::default()).await;
        assert_eq!(fx.gateway.charge_count(), 0);
    }
}

#[cfg(test)]
mod partial_failure_tests {
    use crate::memory::FaultPoint;
    use crate::models::SubscriptionStatus;
    use crate::reconcile::RECONCILED_STATUS;
    use crate::store::TransactionStore;
    use crate::testing::Fixture;
    use time::macros::datetime;
    use time::Duration;

    // =========================================================================
    // Transaction insert fails after a successful charge
    // =========================================================================
    #[tokio::test]
    async fn test_lost_transaction_is_recorded_in_same_cycle() {
        let fx = Fixture::new(datetime!(2025-11-01 00:00 UTC));
        let sub = fx.active_subscription(fx.now());
        fx.store.inject_fault(FaultPoint::TransactionWrite, 1).unwrap();

        let report = fx.engine().run_cycle(&Default::default()).await;
        assert_eq!(report.task(crate::engine::TASK_DUE_SUBSCRIPTIONS).unwrap().processed, 1);
        assert_eq!(report.task(crate::engine::TASK_RECONCILE).unwrap().processed, 1);

        let txns = fx.store.get_subscription_transactions(sub.id).await.unwrap();
        assert_eq!(txns.len(), 1);
        assert_eq!(txns[0].status, RECONCILED_STATUS);
        assert_eq!(fx.gateway.charge_count(), 1);
    }

    // =========================================================================
    // Period advance fails after a successful charge
    // =========================================================================
    #[tokio::test]
    async fn test_lost_period_advance_is_repaired_without_recharge() {
        let fx = Fixture::new(datetime!(2025-11-01 00:00 UTC));
        let sub = fx.active_subscription(fx.now());
        fx.store.inject_fault(FaultPoint::SubscriptionUpdate, 1).unwrap();

        fx.engine().run_cycle(&Default::default()).await;

        let after = fx.subscription(sub.id).await;
        assert_eq!(after.next_billing_at, datetime!(2025-12-01 00:00 UTC));
        assert_eq!(after.status, SubscriptionStatus::Active);
        assert_eq!(fx.gateway.charge_count(), 1);

        // Later cycles find nothing left to do for November.
        fx.clock.advance(Duration::hours(1));
        fx.engine().run_cycle(&Default::default()).await;
        assert_eq!(fx.gateway.charge_count(), 1);
    }

    // =========================================================================
    // One broken task does not starve the others
    // =========================================================================
    #[tokio::test]
    async fn test_each_task_isolated() {
        let fx = Fixture::new(datetime!(2025-11-01 00:00 UTC));
        fx.active_subscription(fx.now());
        fx.store.inject_fault(FaultPoint::PendingQuery, 1).unwrap();
        fx.store.inject_fault(FaultPoint::RetryQuery, 1).unwrap();

        let report = fx.engine().run_cycle(&Default::default()).await;
        assert_eq!(report.tasks.len(), 4);
        assert_eq!(report.failed_tasks(), 2);
        assert_eq!(report.task(crate::engine::TASK_DUE_SUBSCRIPTIONS).unwrap().processed, 1);
        assert!(report.task(crate::engine::TASK_RECONCILE).unwrap().error.is_none());
    }
}
