//! Env-var driven configuration, one `from_env()` per subsystem, in the
//! same style as `data::cache::CachedStore::from_env`.

use anyhow::{Context, Result};

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub database_url: String,
    pub database_max_connections: u32,
    pub redis_url: String,
    pub environment: Environment,
    pub heartbeat_interval_ms: u64,
    pub worker_id: String,
    pub validation_timeout_secs: u64,
    pub max_batch_concurrency: usize,
    pub instance_cap_default: usize,
    pub instance_cap_validation: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Dev,
    Prod,
}

impl WorkerConfig {
    /// Load configuration from the process environment. Loads a local
    /// `.env` file first (dev convenience) via `dotenvy`, matching the
    /// teacher's convention of isolating all env reads behind one
    /// constructor.
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();

        let database_url = std::env::var("DATABASE_URL")
            .context("DATABASE_URL must be set (postgres connection string)")?;

        let environment = match env_or("ENVIRONMENT", "dev").as_str() {
            "prod" | "production" => Environment::Prod,
            _ => Environment::Dev,
        };

        let worker_id = env_or("WORKER_ID", &uuid::Uuid::new_v4().to_string());

        Ok(Self {
            database_url,
            database_max_connections: env_parse_or("DATABASE_MAX_CONNECTIONS", 10),
            redis_url: env_or("REDIS_URL", "redis://127.0.0.1:6379"),
            environment,
            heartbeat_interval_ms: env_parse_or("WORKER_HEARTBEAT_INTERVAL_MS", 5000),
            worker_id,
            validation_timeout_secs: env_parse_or("VALIDATION_TIMEOUT_SECS", 15),
            max_batch_concurrency: env_parse_or("MAX_BATCH_CONCURRENCY", 10),
            instance_cap_default: env_parse_or("INSTANCE_CAP_DEFAULT", 15_000),
            instance_cap_validation: env_parse_or("INSTANCE_CAP_VALIDATION", 100),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_parse_or_falls_back_on_missing_or_bad_value() {
        std::env::remove_var("STRATEGY_WORKER_TEST_VAL");
        assert_eq!(env_parse_or::<u32>("STRATEGY_WORKER_TEST_VAL", 7), 7);

        std::env::set_var("STRATEGY_WORKER_TEST_VAL", "not-a-number");
        assert_eq!(env_parse_or::<u32>("STRATEGY_WORKER_TEST_VAL", 7), 7);

        std::env::set_var("STRATEGY_WORKER_TEST_VAL", "42");
        assert_eq!(env_parse_or::<u32>("STRATEGY_WORKER_TEST_VAL", 7), 42);
        std::env::remove_var("STRATEGY_WORKER_TEST_VAL");
    }
}
