// Test support - panicking on broken fixtures is intended here
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Fixtures for exercising the engine against in-memory stores, a scripted
//! gateway and a manual clock.

use std::collections::HashMap;
use std::sync::Arc;

use time::OffsetDateTime;
use uuid::Uuid;

use crate::attempts::PendingAttemptProcessor;
use crate::clock::{Clock, ManualClock};
use crate::config::EngineConfig;
use crate::due::SubscriptionProcessor;
use crate::engine::BillingEngine;
use crate::gateway::ScriptedGateway;
use crate::memory::InMemoryBillingStore;
use crate::models::{BillingInterval, Card, Plan, Subscription, SubscriptionStatus};
use crate::reconcile::Reconciler;
use crate::retry::RetryService;
use crate::store::{BillingStores, SubscriptionStore};
use crate::subscriptions::SubscriptionService;

pub fn plan(amount_cents: i64, interval: BillingInterval, trial_period_days: i32) -> Plan {
    let created = OffsetDateTime::UNIX_EPOCH;
    Plan {
        id: Uuid::new_v4(),
        name: "standard".to_string(),
        amount_cents,
        currency: "LKR".to_string(),
        interval,
        trial_period_days,
        description: String::new(),
        is_active: true,
        created_at: created,
        updated_at: created,
    }
}

pub fn card_for(user_id: Uuid) -> Card {
    Card {
        id: Uuid::new_v4(),
        user_id,
        gateway_token: format!("tok_{}", Uuid::new_v4().simple()),
        last_four: "1111".to_string(),
        expiry_month: 12,
        expiry_year: 2030,
        scheme: "VISA".to_string(),
        is_default: true,
        created_at: OffsetDateTime::UNIX_EPOCH,
    }
}

/// In-memory engine wiring with a controllable clock and gateway.
pub struct Fixture {
    pub store: InMemoryBillingStore,
    pub gateway: Arc<ScriptedGateway>,
    pub clock: Arc<ManualClock>,
    pub config: EngineConfig,
}

impl Fixture {
    pub fn new(now: OffsetDateTime) -> Self {
        Self {
            store: InMemoryBillingStore::new(),
            gateway: Arc::new(ScriptedGateway::new()),
            clock: Arc::new(ManualClock::new(now)),
            config: EngineConfig::default(),
        }
    }

    pub fn now(&self) -> OffsetDateTime {
        self.clock.now()
    }

    pub fn stores(&self) -> BillingStores {
        BillingStores::from_backend(self.store.clone())
    }

    pub fn add_plan(&self, plan: Plan) -> Plan {
        self.store.insert_plan(plan.clone()).unwrap();
        plan
    }

    pub fn add_card(&self, card: Card) -> Card {
        self.store.insert_card(card.clone()).unwrap();
        card
    }

    /// Monthly 1000.00 LKR subscription with a card on file, due at `next_billing_at`.
    pub fn active_subscription(&self, next_billing_at: OffsetDateTime) -> Subscription {
        self.subscription_with(SubscriptionStatus::Active, next_billing_at)
    }

    pub fn subscription_with(&self, status: SubscriptionStatus, next_billing_at: OffsetDateTime) -> Subscription {
        let user_id = Uuid::new_v4();
        let card = self.add_card(card_for(user_id));
        let sub = Subscription {
            id: Uuid::new_v4(),
            user_id,
            plan_id: None,
            card_id: Some(card.id),
            plan_name: "standard".to_string(),
            amount_cents: 100_000,
            currency: "LKR".to_string(),
            status,
            interval: BillingInterval::Month,
            current_period_start: None,
            current_period_end: Some(next_billing_at),
            trial_start: None,
            trial_end: None,
            cancel_at_period_end: false,
            canceled_at: None,
            metadata: HashMap::new(),
            billing_cycle_anchor: None,
            next_billing_at,
            created_at: next_billing_at - time::Duration::days(30),
            version: 0,
        };
        self.store.put_subscription(sub.clone()).unwrap();
        sub
    }

    pub async fn subscription(&self, id: Uuid) -> Subscription {
        self.store.get_subscription(id).await.unwrap()
    }

    pub fn subscription_service(&self) -> SubscriptionService {
        SubscriptionService::new(self.stores(), self.clock.clone())
    }

    pub fn subscription_processor(&self) -> SubscriptionProcessor {
        SubscriptionProcessor::new(self.stores(), self.gateway.clone(), self.clock.clone(), self.config.clone())
    }

    pub fn pending_processor(&self) -> PendingAttemptProcessor {
        PendingAttemptProcessor::new(self.stores(), self.gateway.clone(), self.clock.clone())
    }

    pub fn retry_service(&self) -> RetryService {
        RetryService::new(self.stores(), self.clock.clone(), self.config.clone())
    }

    pub fn reconciler(&self) -> Reconciler {
        Reconciler::new(self.stores(), self.clock.clone())
    }

    pub fn engine(&self) -> BillingEngine {
        BillingEngine::new(self.stores(), self.gateway.clone(), self.clock.clone(), self.config.clone())
    }
}
