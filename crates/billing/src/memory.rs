//! In-memory implementation of every store contract
//!
//! One shared state behind a mutex, so the cross-entity queries
//! (unrecorded / unadvanced successes) see a consistent view. Used by the
//! test suites and for running the engine locally without Postgres.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::models::{
    is_permanent_decline, AttemptStatus, BillingAttempt, Card, Plan, Subscription,
    SubscriptionStatus, Transaction,
};
use crate::store::{BillingAttemptStore, CardStore, PlanStore, SubscriptionStore, TransactionStore};

/// Operations that can be made to fail on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    DueQuery,
    PendingQuery,
    RetryQuery,
    SubscriptionUpdate,
    TransactionWrite,
}

#[derive(Default)]
struct State {
    plans: HashMap<Uuid, Plan>,
    cards: HashMap<Uuid, Card>,
    subscriptions: HashMap<Uuid, Subscription>,
    attempts: HashMap<Uuid, BillingAttempt>,
    transactions: HashMap<Uuid, Transaction>,
    faults: HashMap<FaultPoint, u32>,
}

impl State {
    fn take_fault(&mut self, point: FaultPoint) -> BillingResult<()> {
        match self.faults.get_mut(&point) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(BillingError::Database(format!("injected fault: {:?}", point)))
            }
            _ => Ok(()),
        }
    }

    fn has_transaction(&self, attempt_id: Uuid) -> bool {
        self.transactions
            .values()
            .any(|t| t.billing_attempt_id == Some(attempt_id))
    }
}

#[derive(Clone, Default)]
pub struct InMemoryBillingStore {
    inner: Arc<Mutex<State>>,
}

impl InMemoryBillingStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> BillingResult<MutexGuard<'_, State>> {
        self.inner
            .lock()
            .map_err(|_| BillingError::Database("in-memory store lock poisoned".to_string()))
    }

    pub fn insert_plan(&self, plan: Plan) -> BillingResult<()> {
        self.state()?.plans.insert(plan.id, plan);
        Ok(())
    }

    pub fn insert_card(&self, card: Card) -> BillingResult<()> {
        self.state()?.cards.insert(card.id, card);
        Ok(())
    }

    pub fn remove_card(&self, id: Uuid) -> BillingResult<()> {
        self.state()?.cards.remove(&id);
        Ok(())
    }

    /// Insert or overwrite a subscription as-is, bypassing version checks.
    pub fn put_subscription(&self, subscription: Subscription) -> BillingResult<()> {
        self.state()?.subscriptions.insert(subscription.id, subscription);
        Ok(())
    }

    /// Insert or overwrite an attempt as-is, bypassing the cycle key check.
    pub fn put_attempt(&self, attempt: BillingAttempt) -> BillingResult<()> {
        self.state()?.attempts.insert(attempt.id, attempt);
        Ok(())
    }

    /// Make the next `times` calls through `point` fail with a database error.
    pub fn inject_fault(&self, point: FaultPoint, times: u32) -> BillingResult<()> {
        self.state()?.faults.insert(point, times);
        Ok(())
    }

    pub fn all_attempts(&self) -> BillingResult<Vec<BillingAttempt>> {
        let mut attempts: Vec<_> = self.state()?.attempts.values().cloned().collect();
        attempts.sort_by_key(|a| (a.created_at, a.attempt_number));
        Ok(attempts)
    }

    pub fn all_transactions(&self) -> BillingResult<Vec<Transaction>> {
        let mut txns: Vec<_> = self.state()?.transactions.values().cloned().collect();
        txns.sort_by_key(|t| t.created_at);
        Ok(txns)
    }
}

#[async_trait]
impl PlanStore for InMemoryBillingStore {
    async fn get_plan(&self, id: Uuid) -> BillingResult<Plan> {
        self.state()?
            .plans
            .get(&id)
            .cloned()
            .ok_or_else(|| BillingError::not_found("plan", id))
    }
}

#[async_trait]
impl CardStore for InMemoryBillingStore {
    async fn get_card(&self, id: Uuid) -> BillingResult<Card> {
        self.state()?
            .cards
            .get(&id)
            .cloned()
            .ok_or_else(|| BillingError::not_found("card", id))
    }
}

#[async_trait]
impl SubscriptionStore for InMemoryBillingStore {
    async fn create_subscription(&self, subscription: &Subscription) -> BillingResult<()> {
        let mut state = self.state()?;
        if state.subscriptions.contains_key(&subscription.id) {
            return Err(BillingError::Conflict(format!(
                "subscription {} already exists",
                subscription.id
            )));
        }
        state.subscriptions.insert(subscription.id, subscription.clone());
        Ok(())
    }

    async fn get_subscription(&self, id: Uuid) -> BillingResult<Subscription> {
        self.state()?
            .subscriptions
            .get(&id)
            .cloned()
            .ok_or_else(|| BillingError::not_found("subscription", id))
    }

    async fn get_user_subscriptions(
        &self,
        user_id: Uuid,
        status: Option<SubscriptionStatus>,
    ) -> BillingResult<Vec<Subscription>> {
        let state = self.state()?;
        let mut subs: Vec<_> = state
            .subscriptions
            .values()
            .filter(|s| s.user_id == user_id && status.is_none_or(|st| s.status == st))
            .cloned()
            .collect();
        subs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(subs)
    }

    async fn update_subscription(&self, subscription: &Subscription) -> BillingResult<Subscription> {
        let mut state = self.state()?;
        state.take_fault(FaultPoint::SubscriptionUpdate)?;

        let current = state
            .subscriptions
            .get(&subscription.id)
            .ok_or_else(|| BillingError::not_found("subscription", subscription.id))?;
        if current.version != subscription.version {
            return Err(BillingError::ConcurrentModification {
                entity: "subscription",
                id: subscription.id.to_string(),
            });
        }

        let mut saved = subscription.clone();
        saved.version += 1;
        state.subscriptions.insert(saved.id, saved.clone());
        Ok(saved)
    }

    async fn cancel_subscription(
        &self,
        id: Uuid,
        at_period_end: bool,
        now: OffsetDateTime,
    ) -> BillingResult<Subscription> {
        let mut state = self.state()?;
        let sub = state
            .subscriptions
            .get_mut(&id)
            .ok_or_else(|| BillingError::not_found("subscription", id))?;

        if at_period_end {
            sub.cancel_at_period_end = true;
        } else {
            sub.status = SubscriptionStatus::Canceled;
            sub.canceled_at = Some(now);
        }
        sub.version += 1;
        Ok(sub.clone())
    }

    async fn get_due_subscriptions(
        &self,
        cutoff: OffsetDateTime,
        now: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<Vec<Subscription>> {
        let mut state = self.state()?;
        state.take_fault(FaultPoint::DueQuery)?;

        let mut due: Vec<_> = state
            .subscriptions
            .values()
            .filter(|s| s.is_due(cutoff, now))
            .cloned()
            .collect();
        due.sort_by_key(|s| s.next_billing_at);
        due.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(due)
    }

    async fn count_active(&self) -> BillingResult<i64> {
        let count = self
            .state()?
            .subscriptions
            .values()
            .filter(|s| s.status == SubscriptionStatus::Active)
            .count();
        Ok(i64::try_from(count).unwrap_or(i64::MAX))
    }
}

#[async_trait]
impl BillingAttemptStore for InMemoryBillingStore {
    async fn create_attempt(&self, attempt: &BillingAttempt) -> BillingResult<()> {
        let mut state = self.state()?;
        let duplicate = state.attempts.values().any(|a| {
            a.subscription_id == attempt.subscription_id
                && a.period_start == attempt.period_start
                && a.attempt_number == attempt.attempt_number
        });
        if duplicate {
            return Err(BillingError::Conflict(format!(
                "attempt {} already exists for subscription {} cycle {}",
                attempt.attempt_number, attempt.subscription_id, attempt.period_start
            )));
        }
        state.attempts.insert(attempt.id, attempt.clone());
        Ok(())
    }

    async fn get_attempt(&self, id: Uuid) -> BillingResult<BillingAttempt> {
        self.state()?
            .attempts
            .get(&id)
            .cloned()
            .ok_or_else(|| BillingError::not_found("billing attempt", id))
    }

    async fn get_subscription_attempts(&self, subscription_id: Uuid) -> BillingResult<Vec<BillingAttempt>> {
        let state = self.state()?;
        let mut attempts: Vec<_> = state
            .attempts
            .values()
            .filter(|a| a.subscription_id == subscription_id)
            .cloned()
            .collect();
        attempts.sort_by_key(|a| (a.created_at, a.attempt_number));
        Ok(attempts)
    }

    async fn get_cycle_attempts(
        &self,
        subscription_id: Uuid,
        period_start: OffsetDateTime,
    ) -> BillingResult<Vec<BillingAttempt>> {
        let state = self.state()?;
        let mut attempts: Vec<_> = state
            .attempts
            .values()
            .filter(|a| a.subscription_id == subscription_id && a.period_start == period_start)
            .cloned()
            .collect();
        attempts.sort_by_key(|a| a.attempt_number);
        Ok(attempts)
    }

    async fn update_attempt(&self, attempt: &BillingAttempt) -> BillingResult<()> {
        let mut state = self.state()?;
        if !state.attempts.contains_key(&attempt.id) {
            return Err(BillingError::not_found("billing attempt", attempt.id));
        }
        state.attempts.insert(attempt.id, attempt.clone());
        Ok(())
    }

    async fn claim_attempt(&self, id: Uuid, now: OffsetDateTime) -> BillingResult<bool> {
        let mut state = self.state()?;
        match state.attempts.get_mut(&id) {
            Some(attempt) if attempt.status.is_claimable() => {
                attempt.mark_processing(now);
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(BillingError::not_found("billing attempt", id)),
        }
    }

    async fn get_pending_attempts(&self, now: OffsetDateTime, limit: i64) -> BillingResult<Vec<BillingAttempt>> {
        let mut state = self.state()?;
        state.take_fault(FaultPoint::PendingQuery)?;

        let mut pending: Vec<_> = state
            .attempts
            .values()
            .filter(|a| a.status.is_claimable() && a.scheduled_at <= now)
            .cloned()
            .collect();
        pending.sort_by_key(|a| a.scheduled_at);
        pending.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(pending)
    }

    async fn get_failed_for_retry(
        &self,
        max_attempts: i32,
        older_than: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<Vec<BillingAttempt>> {
        let mut state = self.state()?;
        state.take_fault(FaultPoint::RetryQuery)?;

        let mut failed: Vec<_> = state
            .attempts
            .values()
            .filter(|a| {
                a.status == AttemptStatus::Failed
                    && a.superseded_at.is_none()
                    && a.attempt_number < max_attempts
                    && a.processed_at.is_some_and(|p| p < older_than)
                    && !is_permanent_decline(a.error_code.as_deref())
            })
            .cloned()
            .collect();
        failed.sort_by_key(|a| a.processed_at);
        failed.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(failed)
    }

    async fn get_exhausted_failures(
        &self,
        max_attempts: i32,
        older_than: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<Vec<BillingAttempt>> {
        let state = self.state()?;
        let mut exhausted: Vec<_> = state
            .attempts
            .values()
            .filter(|a| {
                a.status == AttemptStatus::Failed
                    && a.superseded_at.is_none()
                    && a.processed_at.is_some_and(|p| p < older_than)
                    && (a.attempt_number >= max_attempts
                        || is_permanent_decline(a.error_code.as_deref()))
            })
            .cloned()
            .collect();
        exhausted.sort_by_key(|a| a.processed_at);
        exhausted.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(exhausted)
    }

    async fn mark_superseded(&self, id: Uuid, now: OffsetDateTime) -> BillingResult<bool> {
        let mut state = self.state()?;
        match state.attempts.get_mut(&id) {
            Some(attempt) if attempt.superseded_at.is_none() => {
                attempt.superseded_at = Some(now);
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(BillingError::not_found("billing attempt", id)),
        }
    }

    async fn get_unrecorded_successes(&self, limit: i64) -> BillingResult<Vec<BillingAttempt>> {
        let state = self.state()?;
        let mut unrecorded: Vec<_> = state
            .attempts
            .values()
            .filter(|a| a.status == AttemptStatus::Succeeded && !state.has_transaction(a.id))
            .cloned()
            .collect();
        unrecorded.sort_by_key(|a| a.processed_at);
        unrecorded.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(unrecorded)
    }

    async fn get_unadvanced_successes(&self, limit: i64) -> BillingResult<Vec<BillingAttempt>> {
        let state = self.state()?;
        let mut unadvanced: Vec<_> = state
            .attempts
            .values()
            .filter(|a| {
                a.status == AttemptStatus::Succeeded
                    && state.subscriptions.get(&a.subscription_id).is_some_and(|s| {
                        s.status != SubscriptionStatus::Canceled && s.next_billing_at == a.period_start
                    })
            })
            .cloned()
            .collect();
        unadvanced.sort_by_key(|a| a.processed_at);
        unadvanced.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(unadvanced)
    }

    async fn get_stranded_successes(&self, limit: i64) -> BillingResult<Vec<BillingAttempt>> {
        let state = self.state()?;
        let mut stranded: Vec<_> = state
            .attempts
            .values()
            .filter(|a| {
                a.status == AttemptStatus::Succeeded
                    && state.subscriptions.get(&a.subscription_id).is_some_and(|s| {
                        matches!(s.status, SubscriptionStatus::PastDue | SubscriptionStatus::Unpaid)
                            && s.next_billing_at != a.period_start
                            && !state
                                .attempts
                                .values()
                                .any(|o| o.subscription_id == s.id && o.period_start == s.next_billing_at)
                    })
            })
            .cloned()
            .collect();
        stranded.sort_by_key(|a| a.processed_at);
        stranded.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(stranded)
    }
}

#[async_trait]
impl TransactionStore for InMemoryBillingStore {
    async fn create_transaction(&self, transaction: &Transaction) -> BillingResult<()> {
        let mut state = self.state()?;
        state.take_fault(FaultPoint::TransactionWrite)?;

        if let Some(attempt_id) = transaction.billing_attempt_id {
            if state.has_transaction(attempt_id) {
                return Err(BillingError::Conflict(format!(
                    "billing attempt {} already has a transaction",
                    attempt_id
                )));
            }
        }
        state.transactions.insert(transaction.id, transaction.clone());
        Ok(())
    }

    async fn get_attempt_transaction(&self, attempt_id: Uuid) -> BillingResult<Option<Transaction>> {
        Ok(self
            .state()?
            .transactions
            .values()
            .find(|t| t.billing_attempt_id == Some(attempt_id))
            .cloned())
    }

    async fn get_subscription_transactions(&self, subscription_id: Uuid) -> BillingResult<Vec<Transaction>> {
        let state = self.state()?;
        let mut txns: Vec<_> = state
            .transactions
            .values()
            .filter(|t| t.subscription_id == Some(subscription_id))
            .cloned()
            .collect();
        txns.sort_by_key(|t| t.created_at);
        Ok(txns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::BillingInterval;
    use time::macros::datetime;
    use time::Duration;

    fn subscription(now: OffsetDateTime) -> Subscription {
        Subscription {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            plan_id: None,
            card_id: None,
            plan_name: "basic".to_string(),
            amount_cents: 100_000,
            currency: "LKR".to_string(),
            status: SubscriptionStatus::Active,
            interval: BillingInterval::Month,
            current_period_start: None,
            current_period_end: None,
            trial_start: None,
            trial_end: None,
            cancel_at_period_end: false,
            canceled_at: None,
            metadata: HashMap::new(),
            billing_cycle_anchor: None,
            next_billing_at: now,
            created_at: now,
            version: 0,
        }
    }

    #[tokio::test]
    async fn test_update_is_compare_and_swap() {
        let store = InMemoryBillingStore::new();
        let now = datetime!(2025-05-01 00:00 UTC);
        let sub = subscription(now);
        store.create_subscription(&sub).await.unwrap();

        let mut first = sub.clone();
        first.status = SubscriptionStatus::PastDue;
        let saved = store.update_subscription(&first).await.unwrap();
        assert_eq!(saved.version, 1);

        let mut stale = sub.clone();
        stale.status = SubscriptionStatus::Canceled;
        let err = store.update_subscription(&stale).await.unwrap_err();
        assert!(matches!(err, BillingError::ConcurrentModification { .. }));

        let current = store.get_subscription(sub.id).await.unwrap();
        assert_eq!(current.status, SubscriptionStatus::PastDue);
    }

    #[tokio::test]
    async fn test_cycle_key_is_unique() {
        let store = InMemoryBillingStore::new();
        let now = datetime!(2025-05-01 00:00 UTC);
        let sub = subscription(now);

        let first = BillingAttempt::first_for_cycle(&sub, now, AttemptStatus::Processing, now);
        store.create_attempt(&first).await.unwrap();

        let second = BillingAttempt::first_for_cycle(&sub, now, AttemptStatus::Processing, now);
        assert!(store.create_attempt(&second).await.unwrap_err().is_conflict());

        let next_cycle = BillingAttempt::first_for_cycle(&sub, now + Duration::days(31), AttemptStatus::Pending, now);
        store.create_attempt(&next_cycle).await.unwrap();
    }

    #[tokio::test]
    async fn test_claim_only_once() {
        let store = InMemoryBillingStore::new();
        let now = datetime!(2025-05-01 00:00 UTC);
        let sub = subscription(now);
        let attempt = BillingAttempt::first_for_cycle(&sub, now, AttemptStatus::Pending, now);
        store.create_attempt(&attempt).await.unwrap();

        assert!(store.claim_attempt(attempt.id, now).await.unwrap());
        assert!(!store.claim_attempt(attempt.id, now).await.unwrap());
        assert!(store.get_pending_attempts(now, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_modes() {
        let store = InMemoryBillingStore::new();
        let now = datetime!(2025-05-01 00:00 UTC);
        let a = subscription(now);
        let b = subscription(now);
        store.create_subscription(&a).await.unwrap();
        store.create_subscription(&b).await.unwrap();

        let at_end = store.cancel_subscription(a.id, true, now).await.unwrap();
        assert!(at_end.cancel_at_period_end);
        assert_eq!(at_end.status, SubscriptionStatus::Active);
        assert!(at_end.canceled_at.is_none());

        let immediate = store.cancel_subscription(b.id, false, now).await.unwrap();
        assert_eq!(immediate.status, SubscriptionStatus::Canceled);
        assert_eq!(immediate.canceled_at, Some(now));
        assert_eq!(store.count_active().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_injected_fault_fires_once() {
        let store = InMemoryBillingStore::new();
        let now = datetime!(2025-05-01 00:00 UTC);
        store.inject_fault(FaultPoint::DueQuery, 1).unwrap();

        assert!(store.get_due_subscriptions(now, now, 10).await.is_err());
        assert!(store.get_due_subscriptions(now, now, 10).await.is_ok());
    }
}
