//! Storage contracts
//!
//! The engine only talks to persistence through these traits. Every query that
//! depends on "now" takes the instant explicitly so results follow the
//! injected [`crate::clock::Clock`].

use std::sync::Arc;

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::models::{BillingAttempt, Card, Plan, Subscription, SubscriptionStatus, Transaction};

#[async_trait]
pub trait PlanStore: Send + Sync {
    async fn get_plan(&self, id: Uuid) -> BillingResult<Plan>;
}

#[async_trait]
pub trait CardStore: Send + Sync {
    async fn get_card(&self, id: Uuid) -> BillingResult<Card>;
}

#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn create_subscription(&self, subscription: &Subscription) -> BillingResult<()>;

    async fn get_subscription(&self, id: Uuid) -> BillingResult<Subscription>;

    /// Newest first. `status = None` returns every subscription of the user.
    async fn get_user_subscriptions(
        &self,
        user_id: Uuid,
        status: Option<SubscriptionStatus>,
    ) -> BillingResult<Vec<Subscription>>;

    /// Compare-and-swap on `version`.
    ///
    /// Succeeds only if the stored version still equals `subscription.version`;
    /// returns the saved row with its bumped version. A stale write fails with
    /// `ConcurrentModification`.
    async fn update_subscription(&self, subscription: &Subscription) -> BillingResult<Subscription>;

    /// Immediate cancel sets `canceled` + `canceled_at`; at-period-end only sets the flag.
    async fn cancel_subscription(
        &self,
        id: Uuid,
        at_period_end: bool,
        now: OffsetDateTime,
    ) -> BillingResult<Subscription>;

    /// `active`/`trialing`, not cancelling, `next_billing_at <= cutoff`, trial over at `now`.
    /// Oldest due first.
    async fn get_due_subscriptions(
        &self,
        cutoff: OffsetDateTime,
        now: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<Vec<Subscription>>;

    async fn count_active(&self) -> BillingResult<i64>;
}

#[async_trait]
pub trait BillingAttemptStore: Send + Sync {
    /// Fails with `Conflict` if `(subscription_id, period_start, attempt_number)` already exists.
    async fn create_attempt(&self, attempt: &BillingAttempt) -> BillingResult<()>;

    async fn get_attempt(&self, id: Uuid) -> BillingResult<BillingAttempt>;

    /// Oldest first.
    async fn get_subscription_attempts(&self, subscription_id: Uuid) -> BillingResult<Vec<BillingAttempt>>;

    /// Every attempt for one billing cycle, by ordinal.
    async fn get_cycle_attempts(
        &self,
        subscription_id: Uuid,
        period_start: OffsetDateTime,
    ) -> BillingResult<Vec<BillingAttempt>>;

    async fn update_attempt(&self, attempt: &BillingAttempt) -> BillingResult<()>;

    /// Atomically move a `pending`/`requires_action` attempt to `processing`.
    /// Returns `false` when another processor got there first.
    async fn claim_attempt(&self, id: Uuid, now: OffsetDateTime) -> BillingResult<bool>;

    /// `pending`/`requires_action` with `scheduled_at <= now`, oldest scheduled first.
    async fn get_pending_attempts(&self, now: OffsetDateTime, limit: i64) -> BillingResult<Vec<BillingAttempt>>;

    /// Unsuperseded failures below `max_attempts`, older than `older_than`,
    /// without a permanent decline code. Oldest failure first.
    async fn get_failed_for_retry(
        &self,
        max_attempts: i32,
        older_than: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<Vec<BillingAttempt>>;

    /// Unsuperseded failures older than `older_than` that can no longer be
    /// retried: ordinal at or above `max_attempts`, or a permanent decline code.
    async fn get_exhausted_failures(
        &self,
        max_attempts: i32,
        older_than: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<Vec<BillingAttempt>>;

    /// Stamp `superseded_at` once. Returns `false` if it was already set.
    async fn mark_superseded(&self, id: Uuid, now: OffsetDateTime) -> BillingResult<bool>;

    /// Succeeded attempts that have no linked transaction.
    async fn get_unrecorded_successes(&self, limit: i64) -> BillingResult<Vec<BillingAttempt>>;

    /// Succeeded attempts whose cycle is still the subscription's outstanding
    /// one (`period_start == next_billing_at`) on a non-canceled subscription.
    async fn get_unadvanced_successes(&self, limit: i64) -> BillingResult<Vec<BillingAttempt>>;

    /// Succeeded attempts for a period other than the outstanding one, on a
    /// `past_due`/`unpaid` subscription that has no attempt for its outstanding
    /// cycle yet.
    async fn get_stranded_successes(&self, limit: i64) -> BillingResult<Vec<BillingAttempt>>;
}

#[async_trait]
pub trait TransactionStore: Send + Sync {
    /// Fails with `Conflict` if the attempt already has a transaction.
    async fn create_transaction(&self, transaction: &Transaction) -> BillingResult<()>;

    async fn get_attempt_transaction(&self, attempt_id: Uuid) -> BillingResult<Option<Transaction>>;

    async fn get_subscription_transactions(&self, subscription_id: Uuid) -> BillingResult<Vec<Transaction>>;
}

/// Store handles shared by the processors.
#[derive(Clone)]
pub struct BillingStores {
    pub plans: Arc<dyn PlanStore>,
    pub cards: Arc<dyn CardStore>,
    pub subscriptions: Arc<dyn SubscriptionStore>,
    pub attempts: Arc<dyn BillingAttemptStore>,
    pub transactions: Arc<dyn TransactionStore>,
}

impl BillingStores {
    /// Use one backend for every contract.
    pub fn from_backend<S>(backend: S) -> Self
    where
        S: PlanStore + CardStore + SubscriptionStore + BillingAttemptStore + TransactionStore + 'static,
    {
        let backend = Arc::new(backend);
        Self {
            plans: backend.clone(),
            cards: backend.clone(),
            subscriptions: backend.clone(),
            attempts: backend.clone(),
            transactions: backend,
        }
    }
}
