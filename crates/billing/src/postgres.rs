//! PostgreSQL implementation of the store contracts

use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::models::{
    AttemptStatus, BillingAttempt, BillingInterval, Card, Plan, Subscription, SubscriptionStatus,
    Transaction, TransactionType, PERMANENT_DECLINE_CODES,
};
use crate::store::{BillingAttemptStore, CardStore, PlanStore, SubscriptionStore, TransactionStore};

const SUBSCRIPTION_COLUMNS: &str = "id, user_id, plan_id, card_id, plan_name, amount_cents, currency, \
     status, billing_interval, current_period_start, current_period_end, trial_start, trial_end, \
     cancel_at_period_end, canceled_at, metadata, billing_cycle_anchor, next_billing_at, created_at, version";

const ATTEMPT_COLUMNS: &str = "a.id, a.subscription_id, a.amount_cents, a.currency, a.status, \
     a.attempt_number, a.period_start, a.scheduled_at, a.processed_at, a.gateway_transaction_id, \
     a.error_code, a.error_message, a.superseded_at, a.created_at";

const TRANSACTION_COLUMNS: &str = "id, user_id, card_id, subscription_id, billing_attempt_id, invoice_id, \
     amount_cents, currency, status, gateway_transaction_id, transaction_type, created_at";

#[derive(Clone)]
pub struct PgBillingStore {
    pool: PgPool,
}

impl PgBillingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> BillingResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    /// Apply the embedded schema migrations.
    pub async fn migrate(&self) -> BillingResult<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        tracing::info!("Billing migrations applied");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn permanent_codes() -> Vec<String> {
    PERMANENT_DECLINE_CODES.iter().map(|c| c.to_string()).collect()
}

// =============================================================================
// Row mapping
// =============================================================================

#[derive(Debug, FromRow)]
struct PlanRow {
    id: Uuid,
    name: String,
    amount_cents: i64,
    currency: String,
    billing_interval: String,
    trial_period_days: i32,
    description: String,
    is_active: bool,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl From<PlanRow> for Plan {
    fn from(row: PlanRow) -> Self {
        Plan {
            id: row.id,
            name: row.name,
            amount_cents: row.amount_cents,
            currency: row.currency,
            interval: BillingInterval::parse_or_monthly(&row.billing_interval),
            trial_period_days: row.trial_period_days,
            description: row.description,
            is_active: row.is_active,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct CardRow {
    id: Uuid,
    user_id: Uuid,
    gateway_token: String,
    last_four: String,
    expiry_month: i32,
    expiry_year: i32,
    scheme: String,
    is_default: bool,
    created_at: OffsetDateTime,
}

impl From<CardRow> for Card {
    fn from(row: CardRow) -> Self {
        Card {
            id: row.id,
            user_id: row.user_id,
            gateway_token: row.gateway_token,
            last_four: row.last_four,
            expiry_month: row.expiry_month,
            expiry_year: row.expiry_year,
            scheme: row.scheme,
            is_default: row.is_default,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct SubscriptionRow {
    id: Uuid,
    user_id: Uuid,
    plan_id: Option<Uuid>,
    card_id: Option<Uuid>,
    plan_name: String,
    amount_cents: i64,
    currency: String,
    status: String,
    billing_interval: String,
    current_period_start: Option<OffsetDateTime>,
    current_period_end: Option<OffsetDateTime>,
    trial_start: Option<OffsetDateTime>,
    trial_end: Option<OffsetDateTime>,
    cancel_at_period_end: bool,
    canceled_at: Option<OffsetDateTime>,
    metadata: Json<HashMap<String, String>>,
    billing_cycle_anchor: Option<OffsetDateTime>,
    next_billing_at: OffsetDateTime,
    created_at: OffsetDateTime,
    version: i64,
}

impl TryFrom<SubscriptionRow> for Subscription {
    type Error = BillingError;

    fn try_from(row: SubscriptionRow) -> BillingResult<Self> {
        Ok(Subscription {
            id: row.id,
            user_id: row.user_id,
            plan_id: row.plan_id,
            card_id: row.card_id,
            plan_name: row.plan_name,
            amount_cents: row.amount_cents,
            currency: row.currency,
            status: SubscriptionStatus::parse(&row.status)?,
            interval: BillingInterval::parse_or_monthly(&row.billing_interval),
            current_period_start: row.current_period_start,
            current_period_end: row.current_period_end,
            trial_start: row.trial_start,
            trial_end: row.trial_end,
            cancel_at_period_end: row.cancel_at_period_end,
            canceled_at: row.canceled_at,
            metadata: row.metadata.0,
            billing_cycle_anchor: row.billing_cycle_anchor,
            next_billing_at: row.next_billing_at,
            created_at: row.created_at,
            version: row.version,
        })
    }
}

#[derive(Debug, FromRow)]
struct AttemptRow {
    id: Uuid,
    subscription_id: Uuid,
    amount_cents: i64,
    currency: String,
    status: String,
    attempt_number: i32,
    period_start: OffsetDateTime,
    scheduled_at: OffsetDateTime,
    processed_at: Option<OffsetDateTime>,
    gateway_transaction_id: Option<String>,
    error_code: Option<String>,
    error_message: Option<String>,
    superseded_at: Option<OffsetDateTime>,
    created_at: OffsetDateTime,
}

impl TryFrom<AttemptRow> for BillingAttempt {
    type Error = BillingError;

    fn try_from(row: AttemptRow) -> BillingResult<Self> {
        Ok(BillingAttempt {
            id: row.id,
            subscription_id: row.subscription_id,
            amount_cents: row.amount_cents,
            currency: row.currency,
            status: AttemptStatus::parse(&row.status)?,
            attempt_number: row.attempt_number,
            period_start: row.period_start,
            scheduled_at: row.scheduled_at,
            processed_at: row.processed_at,
            gateway_transaction_id: row.gateway_transaction_id,
            error_code: row.error_code,
            error_message: row.error_message,
            superseded_at: row.superseded_at,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct TransactionRow {
    id: Uuid,
    user_id: Uuid,
    card_id: Option<Uuid>,
    subscription_id: Option<Uuid>,
    billing_attempt_id: Option<Uuid>,
    invoice_id: Option<String>,
    amount_cents: i64,
    currency: String,
    status: String,
    gateway_transaction_id: String,
    transaction_type: String,
    created_at: OffsetDateTime,
}

impl TryFrom<TransactionRow> for Transaction {
    type Error = BillingError;

    fn try_from(row: TransactionRow) -> BillingResult<Self> {
        Ok(Transaction {
            id: row.id,
            user_id: row.user_id,
            card_id: row.card_id,
            subscription_id: row.subscription_id,
            billing_attempt_id: row.billing_attempt_id,
            invoice_id: row.invoice_id,
            amount_cents: row.amount_cents,
            currency: row.currency,
            status: row.status,
            gateway_transaction_id: row.gateway_transaction_id,
            transaction_type: TransactionType::parse(&row.transaction_type)?,
            created_at: row.created_at,
        })
    }
}

fn subscriptions(rows: Vec<SubscriptionRow>) -> BillingResult<Vec<Subscription>> {
    rows.into_iter().map(Subscription::try_from).collect()
}

fn attempts(rows: Vec<AttemptRow>) -> BillingResult<Vec<BillingAttempt>> {
    rows.into_iter().map(BillingAttempt::try_from).collect()
}

// =============================================================================
// Stores
// =============================================================================

#[async_trait]
impl PlanStore for PgBillingStore {
    async fn get_plan(&self, id: Uuid) -> BillingResult<Plan> {
        let row: Option<PlanRow> = sqlx::query_as(
            "SELECT id, name, amount_cents, currency, billing_interval, trial_period_days, \
             description, is_active, created_at, updated_at FROM plans WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Plan::from)
            .ok_or_else(|| BillingError::not_found("plan", id))
    }
}

#[async_trait]
impl CardStore for PgBillingStore {
    async fn get_card(&self, id: Uuid) -> BillingResult<Card> {
        let row: Option<CardRow> = sqlx::query_as(
            "SELECT id, user_id, gateway_token, last_four, expiry_month, expiry_year, scheme, \
             is_default, created_at FROM cards WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Card::from)
            .ok_or_else(|| BillingError::not_found("card", id))
    }
}

#[async_trait]
impl SubscriptionStore for PgBillingStore {
    async fn create_subscription(&self, s: &Subscription) -> BillingResult<()> {
        sqlx::query(
            "INSERT INTO subscriptions (id, user_id, plan_id, card_id, plan_name, amount_cents, currency, \
             status, billing_interval, current_period_start, current_period_end, trial_start, trial_end, \
             cancel_at_period_end, canceled_at, metadata, billing_cycle_anchor, next_billing_at, created_at, \
             updated_at, version) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $19, $20)",
        )
        .bind(s.id)
        .bind(s.user_id)
        .bind(s.plan_id)
        .bind(s.card_id)
        .bind(&s.plan_name)
        .bind(s.amount_cents)
        .bind(&s.currency)
        .bind(s.status.as_str())
        .bind(s.interval.as_str())
        .bind(s.current_period_start)
        .bind(s.current_period_end)
        .bind(s.trial_start)
        .bind(s.trial_end)
        .bind(s.cancel_at_period_end)
        .bind(s.canceled_at)
        .bind(Json(&s.metadata))
        .bind(s.billing_cycle_anchor)
        .bind(s.next_billing_at)
        .bind(s.created_at)
        .bind(s.version)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_subscription(&self, id: Uuid) -> BillingResult<Subscription> {
        let row: Option<SubscriptionRow> =
            sqlx::query_as(&format!("SELECT {} FROM subscriptions WHERE id = $1", SUBSCRIPTION_COLUMNS))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        row.ok_or_else(|| BillingError::not_found("subscription", id))?
            .try_into()
    }

    async fn get_user_subscriptions(
        &self,
        user_id: Uuid,
        status: Option<SubscriptionStatus>,
    ) -> BillingResult<Vec<Subscription>> {
        let rows: Vec<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM subscriptions WHERE user_id = $1 AND ($2::text IS NULL OR status = $2) \
             ORDER BY created_at DESC",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(user_id)
        .bind(status.map(|s| s.as_str()))
        .fetch_all(&self.pool)
        .await?;

        subscriptions(rows)
    }

    async fn update_subscription(&self, s: &Subscription) -> BillingResult<Subscription> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            "UPDATE subscriptions SET card_id = $2, status = $3, current_period_start = $4, \
             current_period_end = $5, trial_start = $6, trial_end = $7, cancel_at_period_end = $8, \
             canceled_at = $9, metadata = $10, billing_cycle_anchor = $11, next_billing_at = $12, \
             updated_at = NOW(), version = version + 1 \
             WHERE id = $1 AND version = $13 \
             RETURNING {}",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(s.id)
        .bind(s.card_id)
        .bind(s.status.as_str())
        .bind(s.current_period_start)
        .bind(s.current_period_end)
        .bind(s.trial_start)
        .bind(s.trial_end)
        .bind(s.cancel_at_period_end)
        .bind(s.canceled_at)
        .bind(Json(&s.metadata))
        .bind(s.billing_cycle_anchor)
        .bind(s.next_billing_at)
        .bind(s.version)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row.try_into(),
            None => {
                // Distinguish a stale version from a missing row.
                self.get_subscription(s.id).await?;
                Err(BillingError::ConcurrentModification {
                    entity: "subscription",
                    id: s.id.to_string(),
                })
            }
        }
    }

    async fn cancel_subscription(
        &self,
        id: Uuid,
        at_period_end: bool,
        now: OffsetDateTime,
    ) -> BillingResult<Subscription> {
        let sql = if at_period_end {
            format!(
                "UPDATE subscriptions SET cancel_at_period_end = TRUE, updated_at = $2, version = version + 1 \
                 WHERE id = $1 RETURNING {}",
                SUBSCRIPTION_COLUMNS
            )
        } else {
            format!(
                "UPDATE subscriptions SET status = 'canceled', canceled_at = $2, updated_at = $2, \
                 version = version + 1 WHERE id = $1 RETURNING {}",
                SUBSCRIPTION_COLUMNS
            )
        };

        let row: Option<SubscriptionRow> = sqlx::query_as(&sql)
            .bind(id)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;

        row.ok_or_else(|| BillingError::not_found("subscription", id))?
            .try_into()
    }

    async fn get_due_subscriptions(
        &self,
        cutoff: OffsetDateTime,
        now: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<Vec<Subscription>> {
        let rows: Vec<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM subscriptions \
             WHERE status IN ('active', 'trialing') \
               AND cancel_at_period_end = FALSE \
               AND next_billing_at <= $1 \
               AND (trial_end IS NULL OR trial_end <= $2) \
             ORDER BY next_billing_at ASC \
             LIMIT $3",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(cutoff)
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        subscriptions(rows)
    }

    async fn count_active(&self) -> BillingResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM subscriptions WHERE status = 'active'")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

#[async_trait]
impl BillingAttemptStore for PgBillingStore {
    async fn create_attempt(&self, a: &BillingAttempt) -> BillingResult<()> {
        sqlx::query(
            "INSERT INTO billing_attempts (id, subscription_id, amount_cents, currency, status, attempt_number, \
             period_start, scheduled_at, processed_at, gateway_transaction_id, error_code, error_message, \
             superseded_at, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $14)",
        )
        .bind(a.id)
        .bind(a.subscription_id)
        .bind(a.amount_cents)
        .bind(&a.currency)
        .bind(a.status.as_str())
        .bind(a.attempt_number)
        .bind(a.period_start)
        .bind(a.scheduled_at)
        .bind(a.processed_at)
        .bind(&a.gateway_transaction_id)
        .bind(&a.error_code)
        .bind(&a.error_message)
        .bind(a.superseded_at)
        .bind(a.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_attempt(&self, id: Uuid) -> BillingResult<BillingAttempt> {
        let row: Option<AttemptRow> = sqlx::query_as(&format!(
            "SELECT {} FROM billing_attempts a WHERE a.id = $1",
            ATTEMPT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.ok_or_else(|| BillingError::not_found("billing attempt", id))?
            .try_into()
    }

    async fn get_subscription_attempts(&self, subscription_id: Uuid) -> BillingResult<Vec<BillingAttempt>> {
        let rows: Vec<AttemptRow> = sqlx::query_as(&format!(
            "SELECT {} FROM billing_attempts a WHERE a.subscription_id = $1 \
             ORDER BY a.created_at ASC, a.attempt_number ASC",
            ATTEMPT_COLUMNS
        ))
        .bind(subscription_id)
        .fetch_all(&self.pool)
        .await?;

        attempts(rows)
    }

    async fn get_cycle_attempts(
        &self,
        subscription_id: Uuid,
        period_start: OffsetDateTime,
    ) -> BillingResult<Vec<BillingAttempt>> {
        let rows: Vec<AttemptRow> = sqlx::query_as(&format!(
            "SELECT {} FROM billing_attempts a WHERE a.subscription_id = $1 AND a.period_start = $2 \
             ORDER BY a.attempt_number ASC",
            ATTEMPT_COLUMNS
        ))
        .bind(subscription_id)
        .bind(period_start)
        .fetch_all(&self.pool)
        .await?;

        attempts(rows)
    }

    async fn update_attempt(&self, a: &BillingAttempt) -> BillingResult<()> {
        let result = sqlx::query(
            "UPDATE billing_attempts SET status = $2, scheduled_at = $3, processed_at = $4, \
             gateway_transaction_id = $5, error_code = $6, error_message = $7, superseded_at = $8, \
             updated_at = NOW() WHERE id = $1",
        )
        .bind(a.id)
        .bind(a.status.as_str())
        .bind(a.scheduled_at)
        .bind(a.processed_at)
        .bind(&a.gateway_transaction_id)
        .bind(&a.error_code)
        .bind(&a.error_message)
        .bind(a.superseded_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BillingError::not_found("billing attempt", a.id));
        }
        Ok(())
    }

    async fn claim_attempt(&self, id: Uuid, now: OffsetDateTime) -> BillingResult<bool> {
        let result = sqlx::query(
            "UPDATE billing_attempts SET status = 'processing', processed_at = $2, updated_at = $2 \
             WHERE id = $1 AND status IN ('pending', 'requires_action')",
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn get_pending_attempts(&self, now: OffsetDateTime, limit: i64) -> BillingResult<Vec<BillingAttempt>> {
        let rows: Vec<AttemptRow> = sqlx::query_as(&format!(
            "SELECT {} FROM billing_attempts a \
             WHERE a.status IN ('pending', 'requires_action') AND a.scheduled_at <= $1 \
             ORDER BY a.scheduled_at ASC \
             LIMIT $2",
            ATTEMPT_COLUMNS
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        attempts(rows)
    }

    async fn get_failed_for_retry(
        &self,
        max_attempts: i32,
        older_than: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<Vec<BillingAttempt>> {
        let rows: Vec<AttemptRow> = sqlx::query_as(&format!(
            "SELECT {} FROM billing_attempts a \
             WHERE a.status = 'failed' \
               AND a.superseded_at IS NULL \
               AND a.attempt_number < $1 \
               AND a.processed_at < $2 \
               AND (a.error_code IS NULL OR lower(a.error_code) <> ALL($3)) \
             ORDER BY a.processed_at ASC \
             LIMIT $4",
            ATTEMPT_COLUMNS
        ))
        .bind(max_attempts)
        .bind(older_than)
        .bind(permanent_codes())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        attempts(rows)
    }

    async fn get_exhausted_failures(
        &self,
        max_attempts: i32,
        older_than: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<Vec<BillingAttempt>> {
        let rows: Vec<AttemptRow> = sqlx::query_as(&format!(
            "SELECT {} FROM billing_attempts a \
             WHERE a.status = 'failed' \
               AND a.superseded_at IS NULL \
               AND a.processed_at < $2 \
               AND (a.attempt_number >= $1 OR lower(a.error_code) = ANY($3)) \
             ORDER BY a.processed_at ASC \
             LIMIT $4",
            ATTEMPT_COLUMNS
        ))
        .bind(max_attempts)
        .bind(older_than)
        .bind(permanent_codes())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        attempts(rows)
    }

    async fn mark_superseded(&self, id: Uuid, now: OffsetDateTime) -> BillingResult<bool> {
        let result = sqlx::query(
            "UPDATE billing_attempts SET superseded_at = $2, updated_at = $2 \
             WHERE id = $1 AND superseded_at IS NULL",
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn get_unrecorded_successes(&self, limit: i64) -> BillingResult<Vec<BillingAttempt>> {
        let rows: Vec<AttemptRow> = sqlx::query_as(&format!(
            "SELECT {} FROM billing_attempts a \
             WHERE a.status = 'succeeded' \
               AND NOT EXISTS (SELECT 1 FROM transactions t WHERE t.billing_attempt_id = a.id) \
             ORDER BY a.processed_at ASC \
             LIMIT $1",
            ATTEMPT_COLUMNS
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        attempts(rows)
    }

    async fn get_unadvanced_successes(&self, limit: i64) -> BillingResult<Vec<BillingAttempt>> {
        let rows: Vec<AttemptRow> = sqlx::query_as(&format!(
            "SELECT {} FROM billing_attempts a \
             JOIN subscriptions s ON s.id = a.subscription_id \
             WHERE a.status = 'succeeded' \
               AND s.status <> 'canceled' \
               AND s.next_billing_at = a.period_start \
             ORDER BY a.processed_at ASC \
             LIMIT $1",
            ATTEMPT_COLUMNS
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        attempts(rows)
    }

    async fn get_stranded_successes(&self, limit: i64) -> BillingResult<Vec<BillingAttempt>> {
        let rows: Vec<AttemptRow> = sqlx::query_as(&format!(
            "SELECT {} FROM billing_attempts a \
             JOIN subscriptions s ON s.id = a.subscription_id \
             WHERE a.status = 'succeeded' \
               AND s.status IN ('past_due', 'unpaid') \
               AND s.next_billing_at <> a.period_start \
               AND NOT EXISTS (SELECT 1 FROM billing_attempts o \
                               WHERE o.subscription_id = s.id AND o.period_start = s.next_billing_at) \
             ORDER BY a.processed_at ASC \
             LIMIT $1",
            ATTEMPT_COLUMNS
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        attempts(rows)
    }
}

#[async_trait]
impl TransactionStore for PgBillingStore {
    async fn create_transaction(&self, t: &Transaction) -> BillingResult<()> {
        sqlx::query(
            "INSERT INTO transactions (id, user_id, card_id, subscription_id, billing_attempt_id, invoice_id, \
             amount_cents, currency, status, gateway_transaction_id, transaction_type, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
        )
        .bind(t.id)
        .bind(t.user_id)
        .bind(t.card_id)
        .bind(t.subscription_id)
        .bind(t.billing_attempt_id)
        .bind(&t.invoice_id)
        .bind(t.amount_cents)
        .bind(&t.currency)
        .bind(&t.status)
        .bind(&t.gateway_transaction_id)
        .bind(t.transaction_type.as_str())
        .bind(t.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_attempt_transaction(&self, attempt_id: Uuid) -> BillingResult<Option<Transaction>> {
        let row: Option<TransactionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM transactions WHERE billing_attempt_id = $1",
            TRANSACTION_COLUMNS
        ))
        .bind(attempt_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Transaction::try_from).transpose()
    }

    async fn get_subscription_transactions(&self, subscription_id: Uuid) -> BillingResult<Vec<Transaction>> {
        let rows: Vec<TransactionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM transactions WHERE subscription_id = $1 ORDER BY created_at ASC",
            TRANSACTION_COLUMNS
        ))
        .bind(subscription_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Transaction::try_from).collect()
    }
}
