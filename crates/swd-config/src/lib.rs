//! Environment configuration.
//!
//! One flat struct read once at process start. Every recognized variable
//! has a default except the connection URLs; a variable that is present but
//! unparsable is a startup error, not a silent fallback.

use std::time::Duration;

use anyhow::{Context, Result};

/// Recognized environment, with defaults.
///
/// | Variable | Default |
/// |---|---|
/// | `PORT` | `3000` |
/// | `DATABASE_URL` | unset → in-memory backends |
/// | `REDIS_URL` | unset (recognized, reserved) |
/// | `QUEUE_CONCURRENCY` | `10` |
/// | `MAX_RETRIES` | `3` |
/// | `LOG_LEVEL` | `info` |
/// | `MOCK_SEED` | unset → entropy |
/// | `RATE_LIMIT` | `30` per minute |
/// | `PING_INTERVAL` | `20000` ms |
/// | `PONG_TIMEOUT` | `10000` ms |
/// | `QUEUE_WAITING_LIMIT` | `100` |
/// | `VISIBILITY_TIMEOUT_MS` | `60000` |
/// | `JANITOR_GRACE_MS` | `60000` |
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub port: u16,
    pub database_url: Option<String>,
    /// Recognized for deployment parity; the in-process stores cover its
    /// concerns today.
    pub redis_url: Option<String>,
    pub queue_concurrency: usize,
    pub max_retries: u32,
    pub log_level: String,
    pub mock_seed: Option<u64>,
    /// Accepted submissions per IP per sliding minute.
    pub rate_limit: u32,
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
    /// Backpressure threshold on queue waiting depth.
    pub queue_waiting_limit: u64,
    pub visibility_timeout: Duration,
    pub janitor_grace: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            database_url: None,
            redis_url: None,
            queue_concurrency: 10,
            max_retries: 3,
            log_level: "info".to_string(),
            mock_seed: None,
            rate_limit: 30,
            ping_interval: Duration::from_millis(20_000),
            pong_timeout: Duration::from_millis(10_000),
            queue_waiting_limit: 100,
            visibility_timeout: Duration::from_millis(60_000),
            janitor_grace: Duration::from_millis(60_000),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            port: parsed("PORT", defaults.port)?,
            database_url: non_empty("DATABASE_URL"),
            redis_url: non_empty("REDIS_URL"),
            queue_concurrency: parsed("QUEUE_CONCURRENCY", defaults.queue_concurrency)?,
            max_retries: parsed("MAX_RETRIES", defaults.max_retries)?,
            log_level: std::env::var("LOG_LEVEL").unwrap_or(defaults.log_level),
            mock_seed: opt_parsed("MOCK_SEED")?,
            rate_limit: parsed("RATE_LIMIT", defaults.rate_limit)?,
            ping_interval: Duration::from_millis(parsed(
                "PING_INTERVAL",
                defaults.ping_interval.as_millis() as u64,
            )?),
            pong_timeout: Duration::from_millis(parsed(
                "PONG_TIMEOUT",
                defaults.pong_timeout.as_millis() as u64,
            )?),
            queue_waiting_limit: parsed("QUEUE_WAITING_LIMIT", defaults.queue_waiting_limit)?,
            visibility_timeout: Duration::from_millis(parsed(
                "VISIBILITY_TIMEOUT_MS",
                defaults.visibility_timeout.as_millis() as u64,
            )?),
            janitor_grace: Duration::from_millis(parsed(
                "JANITOR_GRACE_MS",
                defaults.janitor_grace.as_millis() as u64,
            )?),
        })
    }
}

fn non_empty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn parsed<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .with_context(|| format!("invalid {key}: {raw}")),
        Err(_) => Ok(default),
    }
}

fn opt_parsed<T: std::str::FromStr>(key: &str) -> Result<Option<T>>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) if !raw.is_empty() => raw
            .parse::<T>()
            .map(Some)
            .with_context(|| format!("invalid {key}: {raw}")),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_table() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.port, 3000);
        assert_eq!(cfg.queue_concurrency, 10);
        assert_eq!(cfg.max_retries, 3);
        assert_eq!(cfg.rate_limit, 30);
        assert_eq!(cfg.ping_interval, Duration::from_secs(20));
        assert_eq!(cfg.pong_timeout, Duration::from_secs(10));
        assert_eq!(cfg.queue_waiting_limit, 100);
        assert!(cfg.database_url.is_none());
        assert!(cfg.mock_seed.is_none());
    }

    // Env-var mutation is process-global, so the override behavior is
    // covered in one test rather than several racing ones.
    #[test]
    fn env_overrides_apply_and_bad_values_error() {
        std::env::set_var("PORT", "8123");
        std::env::set_var("MOCK_SEED", "42");
        let cfg = EngineConfig::from_env().unwrap();
        assert_eq!(cfg.port, 8123);
        assert_eq!(cfg.mock_seed, Some(42));

        std::env::set_var("PORT", "not-a-port");
        let err = EngineConfig::from_env().unwrap_err();
        assert!(err.to_string().contains("PORT"));

        std::env::remove_var("PORT");
        std::env::remove_var("MOCK_SEED");
    }
}
