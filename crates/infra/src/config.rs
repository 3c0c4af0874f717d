//! Runtime configuration, loaded from environment variables.

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

pub const ENV_BIND_ADDR: &str = "FORGELEDGER_BIND_ADDR";
pub const ENV_JWT_SECRET: &str = "JWT_SECRET";
pub const ENV_LOCK_TIMEOUT_MS: &str = "FORGELEDGER_LOCK_TIMEOUT_MS";
pub const ENV_QUERY_TIMEOUT_MS: &str = "FORGELEDGER_QUERY_TIMEOUT_MS";
pub const ENV_DATABASE_URL: &str = "DATABASE_URL";
pub const ENV_APPROVER_ROLE: &str = "FORGELEDGER_APPROVER_ROLE";
pub const ENV_POSTER_ROLE: &str = "FORGELEDGER_POSTER_ROLE";

const DEV_JWT_SECRET: &str = "dev-secret";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: '{value}' ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerConfig {
    pub bind_addr: SocketAddr,
    pub jwt_secret: String,
    /// Upper bound on waiting for posting locks.
    pub lock_timeout: Duration,
    /// Default deadline for report queries.
    pub query_timeout: Duration,
    pub database_url: Option<String>,
    pub approver_role: String,
    pub poster_role: String,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            jwt_secret: DEV_JWT_SECRET.to_string(),
            lock_timeout: Duration::from_millis(2_000),
            query_timeout: Duration::from_millis(30_000),
            database_url: None,
            approver_role: forgeledger_auth::Role::APPROVER.to_string(),
            poster_role: forgeledger_auth::Role::POSTER.to_string(),
        }
    }
}

impl LedgerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; unset or blank keys fall back to defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(raw) = get(ENV_BIND_ADDR) {
            config.bind_addr = raw.trim().parse().map_err(|e: std::net::AddrParseError| {
                ConfigError::Invalid {
                    key: ENV_BIND_ADDR,
                    value: raw.clone(),
                    reason: e.to_string(),
                }
            })?;
        }

        match get(ENV_JWT_SECRET) {
            Some(secret) => config.jwt_secret = secret,
            None => tracing::warn!("JWT_SECRET not set; using insecure dev default"),
        }

        if let Some(raw) = get(ENV_LOCK_TIMEOUT_MS) {
            config.lock_timeout = parse_millis(ENV_LOCK_TIMEOUT_MS, &raw)?;
        }
        if let Some(raw) = get(ENV_QUERY_TIMEOUT_MS) {
            config.query_timeout = parse_millis(ENV_QUERY_TIMEOUT_MS, &raw)?;
        }

        config.database_url = get(ENV_DATABASE_URL);

        if let Some(role) = get(ENV_APPROVER_ROLE) {
            config.approver_role = role.trim().to_string();
        }
        if let Some(role) = get(ENV_POSTER_ROLE) {
            config.poster_role = role.trim().to_string();
        }

        Ok(config)
    }
}

fn parse_millis(key: &'static str, raw: &str) -> Result<Duration, ConfigError> {
    let invalid = |reason: &str| ConfigError::Invalid {
        key,
        value: raw.to_string(),
        reason: reason.to_string(),
    };
    let ms: u64 = raw
        .trim()
        .parse()
        .map_err(|_| invalid("expected milliseconds"))?;
    if ms == 0 {
        return Err(invalid("must be greater than zero"));
    }
    Ok(Duration::from_millis(ms))
}
