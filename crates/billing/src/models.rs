//! Billing data model
//!
//! Plans and cards are read-only inputs. The engine owns the status and period
//! fields of [`Subscription`] and [`BillingAttempt`]; [`Transaction`] rows are
//! written once and never updated.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use time::{Date, Duration, Month, OffsetDateTime};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// Currency used when a plan or payment leaves it blank.
pub const DEFAULT_CURRENCY: &str = "LKR";

/// Gateway error codes that are final: never retried regardless of ordinal.
pub const PERMANENT_DECLINE_CODES: [&str; 3] = ["card_declined", "insufficient_funds", "invalid_card"];

/// Case-insensitive: gateways send these upper case.
pub fn is_permanent_decline(code: Option<&str>) -> bool {
    code.is_some_and(|c| PERMANENT_DECLINE_CODES.iter().any(|p| p.eq_ignore_ascii_case(c)))
}

// =============================================================================
// Interval
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BillingInterval {
    Day,
    Week,
    Month,
    Year,
}

impl BillingInterval {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingInterval::Day => "day",
            BillingInterval::Week => "week",
            BillingInterval::Month => "month",
            BillingInterval::Year => "year",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "day" => Some(BillingInterval::Day),
            "week" => Some(BillingInterval::Week),
            "month" => Some(BillingInterval::Month),
            "year" => Some(BillingInterval::Year),
            _ => None,
        }
    }

    /// Parse a stored interval, falling back to monthly for unknown values.
    pub fn parse_or_monthly(s: &str) -> Self {
        Self::parse(s).unwrap_or_else(|| {
            tracing::warn!(interval = s, "Unknown billing interval, defaulting to monthly");
            BillingInterval::Month
        })
    }

    /// Next billing boundary after `from`.
    ///
    /// Calendar months and years clamp to the last day of the target month
    /// (Jan 31 + 1 month = Feb 28/29).
    pub fn advance(&self, from: OffsetDateTime) -> OffsetDateTime {
        match self {
            BillingInterval::Day => from + Duration::days(1),
            BillingInterval::Week => from + Duration::days(7),
            BillingInterval::Month => add_months(from, 1),
            BillingInterval::Year => add_months(from, 12),
        }
    }
}

impl fmt::Display for BillingInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn add_months(from: OffsetDateTime, months: i32) -> OffsetDateTime {
    let date = from.date();
    let index = date.year() * 12 + i32::from(u8::from(date.month())) - 1 + months;
    let year = index.div_euclid(12);
    let shifted = Month::try_from((index.rem_euclid(12) + 1) as u8).and_then(|month| {
        let day = date.day().min(time::util::days_in_year_month(year, month));
        Date::from_calendar_date(year, month, day)
    });

    match shifted {
        Ok(date) => from.replace_date(date),
        Err(e) => {
            // Only reachable at the edges of the representable calendar.
            tracing::error!(from = %from, error = %e, "Calendar overflow advancing billing date");
            from + Duration::days(30 * i64::from(months))
        }
    }
}

// =============================================================================
// Plan & Card (read-only inputs)
// =============================================================================

/// Immutable pricing template a subscription is created from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub id: Uuid,
    pub name: String,
    /// Amount in minor units (cents)
    pub amount_cents: i64,
    pub currency: String,
    pub interval: BillingInterval,
    pub trial_period_days: i32,
    pub description: String,
    pub is_active: bool,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// Saved payment instrument. Only the gateway token is used for charging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Card {
    pub id: Uuid,
    pub user_id: Uuid,
    pub gateway_token: String,
    pub last_four: String,
    pub expiry_month: i32,
    pub expiry_year: i32,
    pub scheme: String,
    pub is_default: bool,
    pub created_at: OffsetDateTime,
}

// =============================================================================
// Subscription
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    PastDue,
    Canceled,
    Incomplete,
    IncompleteExpired,
    Trialing,
    /// Retries exhausted; no further automatic charges.
    Unpaid,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Canceled => "canceled",
            SubscriptionStatus::Incomplete => "incomplete",
            SubscriptionStatus::IncompleteExpired => "incomplete_expired",
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::Unpaid => "unpaid",
        }
    }

    pub fn parse(s: &str) -> BillingResult<Self> {
        match s {
            "active" => Ok(SubscriptionStatus::Active),
            "past_due" => Ok(SubscriptionStatus::PastDue),
            "canceled" => Ok(SubscriptionStatus::Canceled),
            "incomplete" => Ok(SubscriptionStatus::Incomplete),
            "incomplete_expired" => Ok(SubscriptionStatus::IncompleteExpired),
            "trialing" => Ok(SubscriptionStatus::Trialing),
            "unpaid" => Ok(SubscriptionStatus::Unpaid),
            other => Err(BillingError::InvalidState(format!(
                "unknown subscription status '{}'",
                other
            ))),
        }
    }

    /// Statuses the retry policy still works on.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SubscriptionStatus::Active | SubscriptionStatus::PastDue)
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Uuid,
    pub user_id: Uuid,
    pub plan_id: Option<Uuid>,
    pub card_id: Option<Uuid>,
    /// Plan name, amount and currency are frozen at creation.
    pub plan_name: String,
    pub amount_cents: i64,
    pub currency: String,
    pub status: SubscriptionStatus,
    pub interval: BillingInterval,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub trial_start: Option<OffsetDateTime>,
    pub trial_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
    pub canceled_at: Option<OffsetDateTime>,
    pub metadata: HashMap<String, String>,
    pub billing_cycle_anchor: Option<OffsetDateTime>,
    pub next_billing_at: OffsetDateTime,
    pub created_at: OffsetDateTime,
    /// Optimistic concurrency token, bumped by every store update.
    pub version: i64,
}

impl Subscription {
    /// Due-selection predicate used by the stores.
    pub fn is_due(&self, cutoff: OffsetDateTime, now: OffsetDateTime) -> bool {
        matches!(
            self.status,
            SubscriptionStatus::Active | SubscriptionStatus::Trialing
        ) && !self.cancel_at_period_end
            && self.next_billing_at <= cutoff
            && self.trial_end.is_none_or(|end| end <= now)
    }

    /// Move the billing period forward one interval after a successful charge.
    ///
    /// The elapsed boundary becomes the new period start; a `past_due`,
    /// `unpaid` or post-trial subscription becomes `active` again.
    pub fn advance_period(&mut self) {
        let boundary = self.next_billing_at;
        self.current_period_start = Some(boundary);
        self.next_billing_at = self.interval.advance(boundary);
        self.current_period_end = Some(self.next_billing_at);
        if matches!(
            self.status,
            SubscriptionStatus::PastDue | SubscriptionStatus::Trialing | SubscriptionStatus::Unpaid
        ) {
            self.status = SubscriptionStatus::Active;
        }
    }

    /// `past_due`/`unpaid` -> `active`, leaving the schedule alone.
    pub fn restore_active(&mut self) -> bool {
        match self.status {
            SubscriptionStatus::PastDue | SubscriptionStatus::Unpaid => {
                self.status = SubscriptionStatus::Active;
                true
            }
            _ => false,
        }
    }

    /// Returns true when the status actually changed.
    pub fn mark_past_due(&mut self) -> bool {
        match self.status {
            SubscriptionStatus::Active | SubscriptionStatus::Trialing => {
                self.status = SubscriptionStatus::PastDue;
                true
            }
            _ => false,
        }
    }
}

// =============================================================================
// Billing attempt
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Pending,
    Processing,
    Succeeded,
    Failed,
    RequiresAction,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptStatus::Pending => "pending",
            AttemptStatus::Processing => "processing",
            AttemptStatus::Succeeded => "succeeded",
            AttemptStatus::Failed => "failed",
            AttemptStatus::RequiresAction => "requires_action",
        }
    }

    pub fn parse(s: &str) -> BillingResult<Self> {
        match s {
            "pending" => Ok(AttemptStatus::Pending),
            "processing" => Ok(AttemptStatus::Processing),
            "succeeded" => Ok(AttemptStatus::Succeeded),
            "failed" => Ok(AttemptStatus::Failed),
            "requires_action" => Ok(AttemptStatus::RequiresAction),
            other => Err(BillingError::InvalidState(format!(
                "unknown billing attempt status '{}'",
                other
            ))),
        }
    }

    /// Statuses the pending-attempt processor may claim.
    pub fn is_claimable(&self) -> bool {
        matches!(self, AttemptStatus::Pending | AttemptStatus::RequiresAction)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, AttemptStatus::Succeeded | AttemptStatus::Failed)
    }
}

impl fmt::Display for AttemptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingAttempt {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub amount_cents: i64,
    pub currency: String,
    pub status: AttemptStatus,
    /// 1-based ordinal within one billing cycle
    pub attempt_number: i32,
    /// Start of the billing period this charge pays for (cycle key)
    pub period_start: OffsetDateTime,
    pub scheduled_at: OffsetDateTime,
    pub processed_at: Option<OffsetDateTime>,
    pub gateway_transaction_id: Option<String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    /// Set once the retry policy has acted on this failed attempt
    pub superseded_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
}

impl BillingAttempt {
    /// First attempt (ordinal 1) for the cycle starting at `period_start`.
    pub fn first_for_cycle(
        subscription: &Subscription,
        period_start: OffsetDateTime,
        status: AttemptStatus,
        now: OffsetDateTime,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            subscription_id: subscription.id,
            amount_cents: subscription.amount_cents,
            currency: subscription.currency.clone(),
            status,
            attempt_number: 1,
            period_start,
            scheduled_at: now,
            processed_at: (status == AttemptStatus::Processing).then_some(now),
            gateway_transaction_id: None,
            error_code: None,
            error_message: None,
            superseded_at: None,
            created_at: now,
        }
    }

    /// Next pending attempt in the same cycle as `failed`.
    pub fn retry_of(failed: &BillingAttempt, scheduled_at: OffsetDateTime, now: OffsetDateTime) -> Self {
        Self {
            id: Uuid::new_v4(),
            subscription_id: failed.subscription_id,
            amount_cents: failed.amount_cents,
            currency: failed.currency.clone(),
            status: AttemptStatus::Pending,
            attempt_number: failed.attempt_number + 1,
            period_start: failed.period_start,
            scheduled_at,
            processed_at: None,
            gateway_transaction_id: None,
            error_code: None,
            error_message: None,
            superseded_at: None,
            created_at: now,
        }
    }

    pub fn mark_processing(&mut self, now: OffsetDateTime) {
        self.status = AttemptStatus::Processing;
        self.processed_at = Some(now);
    }

    pub fn mark_failed(&mut self, code: Option<String>, message: impl Into<String>, now: OffsetDateTime) {
        self.status = AttemptStatus::Failed;
        self.error_code = code;
        self.error_message = Some(message.into());
        self.processed_at = Some(now);
    }

    pub fn mark_succeeded(&mut self, gateway_transaction_id: String, now: OffsetDateTime) {
        self.status = AttemptStatus::Succeeded;
        self.gateway_transaction_id = Some(gateway_transaction_id);
        self.error_code = None;
        self.error_message = None;
        self.processed_at = Some(now);
    }
}

// =============================================================================
// Transaction
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Manual,
    Recurring,
    Authorization,
    Capture,
    Void,
    Refund,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Manual => "manual",
            TransactionType::Recurring => "recurring",
            TransactionType::Authorization => "authorization",
            TransactionType::Capture => "capture",
            TransactionType::Void => "void",
            TransactionType::Refund => "refund",
        }
    }

    pub fn parse(s: &str) -> BillingResult<Self> {
        match s {
            "manual" => Ok(TransactionType::Manual),
            "recurring" => Ok(TransactionType::Recurring),
            "authorization" => Ok(TransactionType::Authorization),
            "capture" => Ok(TransactionType::Capture),
            "void" => Ok(TransactionType::Void),
            "refund" => Ok(TransactionType::Refund),
            other => Err(BillingError::InvalidState(format!(
                "unknown transaction type '{}'",
                other
            ))),
        }
    }
}

/// Immutable record of a completed charge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Uuid,
    pub user_id: Uuid,
    pub card_id: Option<Uuid>,
    pub subscription_id: Option<Uuid>,
    pub billing_attempt_id: Option<Uuid>,
    pub invoice_id: Option<String>,
    pub amount_cents: i64,
    pub currency: String,
    /// Gateway-reported transaction status
    pub status: String,
    pub gateway_transaction_id: String,
    pub transaction_type: TransactionType,
    pub created_at: OffsetDateTime,
}

impl Transaction {
    /// Recurring charge record linked to the subscription and attempt that produced it.
    pub fn recurring(
        subscription: &Subscription,
        attempt: &BillingAttempt,
        gateway_status: String,
        gateway_transaction_id: String,
        now: OffsetDateTime,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: subscription.user_id,
            card_id: subscription.card_id,
            subscription_id: Some(subscription.id),
            billing_attempt_id: Some(attempt.id),
            invoice_id: Some(format!("INV-{}", now.unix_timestamp())),
            amount_cents: attempt.amount_cents,
            currency: attempt.currency.clone(),
            status: gateway_status,
            gateway_transaction_id,
            transaction_type: TransactionType::Recurring,
            created_at: now,
        }
    }
}

/// Render minor units as the two-decimal string the gateway expects.
pub fn format_amount(amount_cents: i64) -> String {
    let sign = if amount_cents < 0 { "-" } else { "" };
    let abs = amount_cents.unsigned_abs();
    format!("{}{}.{:02}", sign, abs / 100, abs % 100)
}
