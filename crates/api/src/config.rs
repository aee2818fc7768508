//! API server configuration

use lessonloop_billing::DEFAULT_TOLERANCE_SECS;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{key} is invalid: {reason}")]
    Invalid { key: &'static str, reason: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    /// Separate URL for migrations when queries go through a pooler
    pub database_direct_url: Option<String>,
    pub bind_address: String,
    pub webhook_secret: String,
    pub webhook_tolerance_secs: i64,
    pub run_migrations: bool,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let webhook_tolerance_secs = match optional("WEBHOOK_TOLERANCE_SECONDS") {
            Some(raw) => raw
                .parse::<i64>()
                .ok()
                .filter(|secs| *secs > 0)
                .ok_or_else(|| ConfigError::Invalid {
                    key: "WEBHOOK_TOLERANCE_SECONDS",
                    reason: format!("expected a positive number of seconds, got '{}'", raw),
                })?,
            None => DEFAULT_TOLERANCE_SECS,
        };

        let run_migrations = match optional("RUN_MIGRATIONS") {
            Some(raw) => parse_flag(&raw).ok_or_else(|| ConfigError::Invalid {
                key: "RUN_MIGRATIONS",
                reason: format!("expected true or false, got '{}'", raw),
            })?,
            None => true,
        };

        Ok(Self {
            database_url: required("DATABASE_URL")?,
            database_direct_url: optional("DATABASE_DIRECT_URL"),
            bind_address: optional("BIND_ADDRESS").unwrap_or_else(|| "0.0.0.0:8080".to_string()),
            webhook_secret: required("STRIPE_WEBHOOK_SECRET")?,
            webhook_tolerance_secs,
            run_migrations,
        })
    }

    pub fn migration_url(&self) -> &str {
        self.database_direct_url
            .as_deref()
            .unwrap_or(&self.database_url)
    }
}

fn optional(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn required(key: &'static str) -> Result<String, ConfigError> {
    optional(key).ok_or(ConfigError::Missing(key))
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}
