// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Cadence Billing Worker
//!
//! Hosts the billing engine on a timer and exposes its health to operators.

pub mod admin;
pub mod config;
pub mod error;
pub mod manager;
pub mod scheduler;

pub use config::{LogFormat, WorkerConfig};
pub use error::{WorkerError, WorkerResult};
pub use manager::WorkerManager;
pub use scheduler::{BillingScheduler, HealthSnapshot, WorkerStatus};
