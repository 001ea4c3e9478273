// Billing crate clippy configuration
// These are intentional patterns in this crate:
#![allow(clippy::result_large_err)] // BillingError carries owned context strings
#![allow(clippy::too_many_arguments)] // Row conversions mirror wide tables
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Cadence Billing Engine
//!
//! Unattended recurring billing for card-on-file subscriptions.
//!
//! ## Features
//!
//! - **Due Processing**: Charge subscriptions whose period has ended and advance them
//! - **Pending Attempts**: Claim and charge queued attempts (first charge, retries)
//! - **Retry Policy**: Backoff of 0h / 72h / 168h, permanent declines never retried
//! - **Reconciliation**: Repair charges whose transaction or period advance was lost
//! - **Subscriptions**: Create, cancel and re-card subscriptions
//! - **Stores**: Postgres (sqlx) and in-memory implementations of every store

pub mod attempts;
pub mod charge;
pub mod clock;
pub mod config;
pub mod due;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod gateway_client;
pub mod memory;
pub mod models;
pub mod postgres;
pub mod reconcile;
pub mod retry;
pub mod store;
pub mod subscriptions;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

#[cfg(test)]
mod edge_case_tests;

// Attempts
pub use attempts::PendingAttemptProcessor;

// Clock
pub use clock::{Clock, ManualClock, SystemClock};

// Config
pub use config::{EngineConfig, GatewayConfig, DUE_SUBSCRIPTION_HARD_CAP};

// Due
pub use due::{DueOutcome, SubscriptionProcessor};

// Engine
pub use engine::{BillingEngine, CycleReport, TaskReport};

// Error
pub use error::{BillingError, BillingResult};

// Gateway
pub use gateway::{GatewayResponse, PaymentGateway, ScriptedGateway, ScriptedOutcome};
pub use gateway_client::HttpPaymentGateway;

// Models
pub use models::{
    AttemptStatus, BillingAttempt, BillingInterval, Card, Plan, Subscription, SubscriptionStatus,
    Transaction, TransactionType,
};

// Reconcile
pub use reconcile::{ReconcileReport, Reconciler};

// Retry
pub use retry::{RetryDecision, RetryPolicy, RetryService};

// Stores
pub use memory::InMemoryBillingStore;
pub use postgres::PgBillingStore;
pub use store::{
    BillingAttemptStore, BillingStores, CardStore, PlanStore, SubscriptionStore, TransactionStore,
};

// Subscriptions
pub use subscriptions::{BillingHistory, CreateSubscription, SubscriptionService};
