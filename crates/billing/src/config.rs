//! Engine and gateway configuration
//!
//! Every limit and interval the engine uses comes from here. Values are read
//! from the environment with defaults; a value that is present but does not
//! parse is a [`BillingError::Config`], never silently replaced.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{BillingError, BillingResult};

/// Largest batch the due-subscription query will ever return.
pub const DUE_SUBSCRIPTION_HARD_CAP: i64 = 100;

/// Tunables for one billing engine instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Seconds between scheduler cycles
    pub cycle_interval_secs: u64,

    /// Per-request timeout for gateway calls
    pub gateway_timeout_secs: u64,

    /// Successful due charges per cycle (also capped by [`DUE_SUBSCRIPTION_HARD_CAP`])
    pub due_subscription_limit: i64,

    pub pending_attempt_limit: i64,

    pub retry_scan_limit: i64,

    /// Minimum age of a failed attempt before the retry policy looks at it
    pub retry_cooldown_secs: u64,

    /// How far ahead of `next_billing_at` a subscription counts as due
    pub due_lookahead_secs: u64,

    pub max_retry_attempts: i32,

    pub reconcile_limit: i64,

    /// Move subscriptions to `unpaid` once their retries are exhausted
    pub mark_unpaid_after_retries: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cycle_interval_secs: default_cycle_interval_secs(),
            gateway_timeout_secs: default_gateway_timeout_secs(),
            due_subscription_limit: default_due_subscription_limit(),
            pending_attempt_limit: default_pending_attempt_limit(),
            retry_scan_limit: default_retry_scan_limit(),
            retry_cooldown_secs: default_retry_cooldown_secs(),
            due_lookahead_secs: default_due_lookahead_secs(),
            max_retry_attempts: default_max_retry_attempts(),
            reconcile_limit: default_reconcile_limit(),
            mark_unpaid_after_retries: default_mark_unpaid_after_retries(),
        }
    }
}

impl EngineConfig {
    /// Load engine configuration from `BILLING_*` environment variables.
    pub fn from_env() -> BillingResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> BillingResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = parse_var(&lookup, "BILLING_CYCLE_INTERVAL_SECS")? {
            config.cycle_interval_secs = v;
        }
        if let Some(v) = parse_var(&lookup, "BILLING_GATEWAY_TIMEOUT_SECS")? {
            config.gateway_timeout_secs = v;
        }
        if let Some(v) = parse_var(&lookup, "BILLING_DUE_SUBSCRIPTION_LIMIT")? {
            config.due_subscription_limit = v;
        }
        if let Some(v) = parse_var(&lookup, "BILLING_PENDING_ATTEMPT_LIMIT")? {
            config.pending_attempt_limit = v;
        }
        if let Some(v) = parse_var(&lookup, "BILLING_RETRY_SCAN_LIMIT")? {
            config.retry_scan_limit = v;
        }
        if let Some(v) = parse_var(&lookup, "BILLING_RETRY_COOLDOWN_SECS")? {
            config.retry_cooldown_secs = v;
        }
        if let Some(v) = parse_var(&lookup, "BILLING_DUE_LOOKAHEAD_SECS")? {
            config.due_lookahead_secs = v;
        }
        if let Some(v) = parse_var(&lookup, "BILLING_MAX_RETRY_ATTEMPTS")? {
            config.max_retry_attempts = v;
        }
        if let Some(v) = parse_var(&lookup, "BILLING_RECONCILE_LIMIT")? {
            config.reconcile_limit = v;
        }
        if let Some(v) = parse_var(&lookup, "BILLING_MARK_UNPAID_AFTER_RETRIES")? {
            config.mark_unpaid_after_retries = v;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> BillingResult<()> {
        if self.cycle_interval_secs == 0 {
            return Err(BillingError::Config(
                "cycle interval must be at least one second".to_string(),
            ));
        }
        if self.gateway_timeout_secs == 0 {
            return Err(BillingError::Config(
                "gateway timeout must be at least one second".to_string(),
            ));
        }
        for (name, value) in [
            ("due_subscription_limit", self.due_subscription_limit),
            ("pending_attempt_limit", self.pending_attempt_limit),
            ("retry_scan_limit", self.retry_scan_limit),
            ("reconcile_limit", self.reconcile_limit),
        ] {
            if value <= 0 {
                return Err(BillingError::Config(format!(
                    "{} must be positive, got {}",
                    name, value
                )));
            }
        }
        if self.max_retry_attempts < 1 {
            return Err(BillingError::Config(format!(
                "max_retry_attempts must be at least 1, got {}",
                self.max_retry_attempts
            )));
        }
        Ok(())
    }

    pub fn cycle_interval(&self) -> Duration {
        Duration::from_secs(self.cycle_interval_secs)
    }

    pub fn gateway_timeout(&self) -> Duration {
        Duration::from_secs(self.gateway_timeout_secs)
    }

    pub fn retry_cooldown(&self) -> time::Duration {
        time::Duration::seconds(saturating_secs(self.retry_cooldown_secs))
    }

    pub fn due_lookahead(&self) -> time::Duration {
        time::Duration::seconds(saturating_secs(self.due_lookahead_secs))
    }
}

fn saturating_secs(secs: u64) -> i64 {
    i64::try_from(secs).unwrap_or(i64::MAX)
}

fn default_cycle_interval_secs() -> u64 {
    300
}

fn default_gateway_timeout_secs() -> u64 {
    30
}

fn default_due_subscription_limit() -> i64 {
    DUE_SUBSCRIPTION_HARD_CAP
}

fn default_pending_attempt_limit() -> i64 {
    50
}

fn default_retry_scan_limit() -> i64 {
    50
}

fn default_retry_cooldown_secs() -> u64 {
    24 * 60 * 60
}

fn default_due_lookahead_secs() -> u64 {
    5 * 60
}

fn default_max_retry_attempts() -> i32 {
    3
}

fn default_reconcile_limit() -> i64 {
    50
}

fn default_mark_unpaid_after_retries() -> bool {
    true
}

fn default_api_version() -> u32 {
    100
}

/// Credentials and endpoint for the hosted payment gateway.
#[derive(Clone)]
pub struct GatewayConfig {
    pub host: String,
    pub merchant_id: String,
    pub api_password: String,
    pub api_version: u32,
}

impl GatewayConfig {
    pub fn from_env() -> BillingResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> BillingResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        Ok(Self {
            host: required_var(&lookup, "GATEWAY_HOST")?,
            merchant_id: required_var(&lookup, "GATEWAY_MERCHANT_ID")?,
            api_password: required_var(&lookup, "GATEWAY_API_PASSWORD")?,
            api_version: parse_var(&lookup, "GATEWAY_API_VERSION")?.unwrap_or_else(default_api_version),
        })
    }
}

impl fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("host", &self.host)
            .field("merchant_id", &self.merchant_id)
            .field("api_password", &"[REDACTED]")
            .field("api_version", &self.api_version)
            .finish()
    }
}

fn required_var<F>(lookup: &F, key: &str) -> BillingResult<String>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(BillingError::Config(format!("{} must be set", key))),
    }
}

/// Parse an optional variable; present-but-invalid is an error.
pub fn parse_var<F, T>(lookup: &F, key: &str) -> BillingResult<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| BillingError::Config(format!("invalid {}='{}': {}", key, raw, e))),
    }
}
