//! Charge execution shared by the due-subscription and pending-attempt paths

use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::gateway::{GatewayResponse, PaymentGateway};
use crate::models::{AttemptStatus, BillingAttempt, Card, Subscription, SubscriptionStatus, Transaction};
use crate::store::{BillingAttemptStore, SubscriptionStore, TransactionStore};

/// Attempts at a read-modify-write before giving up on a contended subscription.
const MAX_CAS_ATTEMPTS: usize = 3;

/// What the gateway said about one charge.
#[derive(Debug, Clone)]
pub enum ChargeOutcome {
    Approved(GatewayResponse),
    /// Gateway code and result exactly as the gateway sent them.
    Declined { code: Option<String>, message: String },
    /// Transport, HTTP or decode failure; no gateway code available.
    Error(String),
}

impl ChargeOutcome {
    pub fn is_approved(&self) -> bool {
        matches!(self, ChargeOutcome::Approved(_))
    }

    /// Write the terminal status onto the attempt.
    pub fn apply(&self, attempt: &mut BillingAttempt, now: OffsetDateTime) {
        match self {
            ChargeOutcome::Approved(resp) => attempt.mark_succeeded(resp.transaction.id.clone(), now),
            ChargeOutcome::Declined { code, message } => {
                attempt.mark_failed(code.clone(), message.clone(), now)
            }
            ChargeOutcome::Error(message) => attempt.mark_failed(None, message.clone(), now),
        }
    }
}

/// Charge the card for the attempt's amount. Never returns an error: transport
/// failures become [`ChargeOutcome::Error`].
pub async fn charge_card(gateway: &dyn PaymentGateway, card: &Card, attempt: &BillingAttempt) -> ChargeOutcome {
    match gateway
        .charge(&card.gateway_token, attempt.amount_cents, &attempt.currency)
        .await
    {
        Ok(resp) if resp.is_approved() => ChargeOutcome::Approved(resp),
        Ok(resp) => ChargeOutcome::Declined {
            code: resp.gateway_code().map(str::to_string),
            message: resp.result.clone(),
        },
        Err(e) => ChargeOutcome::Error(e.to_string()),
    }
}

/// Record the transaction for an approved charge.
///
/// A failure here does not undo the charge; it is logged for the reconcile
/// task to repair. Returns whether the row was written.
pub async fn record_transaction(
    transactions: &dyn TransactionStore,
    subscription: &Subscription,
    attempt: &BillingAttempt,
    response: &GatewayResponse,
    now: OffsetDateTime,
) -> bool {
    let txn = Transaction::recurring(
        subscription,
        attempt,
        response.transaction.status.clone(),
        response.transaction.id.clone(),
        now,
    );

    match transactions.create_transaction(&txn).await {
        Ok(()) => true,
        Err(e) => {
            tracing::error!(
                subscription_id = %subscription.id,
                attempt_id = %attempt.id,
                gateway_transaction_id = %response.transaction.id,
                error = %e,
                "Charge succeeded but transaction was not recorded - RECONCILIATION NEEDED"
            );
            false
        }
    }
}

/// Read-modify-write a subscription under its version check.
///
/// `change` returns false to leave the row untouched. Returns the saved row, or
/// `None` when nothing changed.
pub async fn mutate_subscription<F>(
    store: &dyn SubscriptionStore,
    id: Uuid,
    mut change: F,
) -> BillingResult<Option<Subscription>>
where
    F: FnMut(&mut Subscription) -> bool + Send,
{
    let mut last_err = None;
    for _ in 0..MAX_CAS_ATTEMPTS {
        let mut sub = store.get_subscription(id).await?;
        if !change(&mut sub) {
            return Ok(None);
        }
        match store.update_subscription(&sub).await {
            Ok(saved) => return Ok(Some(saved)),
            Err(e @ BillingError::ConcurrentModification { .. }) => {
                tracing::debug!(subscription_id = %id, "Subscription changed underneath us, reloading");
                last_err = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_err.unwrap_or_else(|| BillingError::ConcurrentModification {
        entity: "subscription",
        id: id.to_string(),
    }))
}

/// Advance the subscription past the cycle `period_start` if that cycle is
/// still outstanding. Returns the advanced row, or `None` if it had already
/// moved on (or was canceled).
pub async fn settle_cycle(
    store: &dyn SubscriptionStore,
    subscription_id: Uuid,
    period_start: OffsetDateTime,
) -> BillingResult<Option<Subscription>> {
    mutate_subscription(store, subscription_id, |sub| {
        if sub.status == SubscriptionStatus::Canceled || sub.next_billing_at != period_start {
            return false;
        }
        sub.advance_period();
        true
    })
    .await
}

/// Return a `past_due`/`unpaid` subscription to `active` after a paid charge
/// for some period other than the one it still owes. The schedule does not
/// move, and the status stays while the owed cycle has an unpaid attempt.
pub async fn restore_after_payment(
    subscriptions: &dyn SubscriptionStore,
    attempts: &dyn BillingAttemptStore,
    subscription_id: Uuid,
) -> BillingResult<Option<Subscription>> {
    let owed = subscriptions.get_subscription(subscription_id).await?.next_billing_at;
    let cycle = attempts.get_cycle_attempts(subscription_id, owed).await?;
    if cycle.iter().any(|a| a.status != AttemptStatus::Succeeded) {
        return Ok(None);
    }

    mutate_subscription(subscriptions, subscription_id, |sub| {
        sub.next_billing_at == owed && sub.restore_active()
    })
    .await
}

/// `active`/`trialing` -> `past_due`. No-op for any other status.
pub async fn mark_past_due(store: &dyn SubscriptionStore, subscription_id: Uuid) -> BillingResult<bool> {
    let changed = mutate_subscription(store, subscription_id, |sub| sub.mark_past_due()).await?;
    Ok(changed.is_some())
}
