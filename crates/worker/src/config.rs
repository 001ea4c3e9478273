//! Worker process configuration

use std::fmt;
use std::time::Duration;

use cadence_billing::config::parse_var;
use cadence_billing::{EngineConfig, GatewayConfig};

use crate::error::{WorkerError, WorkerResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" | "pretty" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("expected 'text' or 'json', got '{}'", other)),
        }
    }
}

#[derive(Clone)]
pub struct WorkerConfig {
    pub database_url: String,
    pub database_max_connections: u32,
    /// Address for the operator endpoints
    pub admin_bind_addr: String,
    /// Pause after all workers have stopped, before reporting stopped
    pub stop_grace_secs: u64,
    pub log_format: LogFormat,
    pub engine: EngineConfig,
    pub gateway: GatewayConfig,
}

impl WorkerConfig {
    pub fn from_env() -> WorkerResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> WorkerResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = lookup("DATABASE_URL")
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| WorkerError::Config("DATABASE_URL must be set".to_string()))?;

        Ok(Self {
            database_url,
            database_max_connections: parse_var(&lookup, "DATABASE_MAX_CONNECTIONS")?.unwrap_or(5),
            admin_bind_addr: lookup("ADMIN_BIND_ADDR").unwrap_or_else(|| "0.0.0.0:8081".to_string()),
            stop_grace_secs: parse_var(&lookup, "WORKER_STOP_GRACE_SECS")?.unwrap_or(2),
            log_format: parse_var(&lookup, "LOG_FORMAT")?.unwrap_or_default(),
            engine: EngineConfig::from_lookup(&lookup)?,
            gateway: GatewayConfig::from_lookup(&lookup)?,
        })
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }
}

impl fmt::Debug for WorkerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerConfig")
            .field("database_url", &"[REDACTED]")
            .field("database_max_connections", &self.database_max_connections)
            .field("admin_bind_addr", &self.admin_bind_addr)
            .field("stop_grace_secs", &self.stop_grace_secs)
            .field("log_format", &self.log_format)
            .field("engine", &self.engine)
            .field("gateway", &self.gateway)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    const REQUIRED: [(&str, &str); 4] = [
        ("DATABASE_URL", "postgres://localhost/cadence"),
        ("GATEWAY_HOST", "gateway.example.com"),
        ("GATEWAY_MERCHANT_ID", "TEST01"),
        ("GATEWAY_API_PASSWORD", "secret"),
    ];

    #[test]
    fn test_defaults() {
        let config = WorkerConfig::from_lookup(lookup(&REQUIRED)).unwrap();
        assert_eq!(config.database_max_connections, 5);
        assert_eq!(config.admin_bind_addr, "0.0.0.0:8081");
        assert_eq!(config.stop_grace(), Duration::from_secs(2));
        assert_eq!(config.log_format, LogFormat::Text);
        assert_eq!(config.engine, EngineConfig::default());
    }

    #[test]
    fn test_overrides_and_invalid_values() {
        let mut vars = REQUIRED.to_vec();
        vars.push(("LOG_FORMAT", "JSON"));
        vars.push(("BILLING_CYCLE_INTERVAL_SECS", "60"));
        let config = WorkerConfig::from_lookup(lookup(&vars)).unwrap();
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.engine.cycle_interval_secs, 60);

        let mut bad = REQUIRED.to_vec();
        bad.push(("WORKER_STOP_GRACE_SECS", "soon"));
        assert!(WorkerConfig::from_lookup(lookup(&bad)).is_err());
    }

    #[test]
    fn test_database_url_required_and_redacted() {
        let err = WorkerConfig::from_lookup(lookup(&REQUIRED[1..])).unwrap_err();
        assert!(err.to_string().contains("DATABASE_URL"));

        let config = WorkerConfig::from_lookup(lookup(&REQUIRED)).unwrap();
        let debug = format!("{:?}", config);
        assert!(!debug.contains("postgres://"));
        assert!(!debug.contains("secret"));
    }
}
