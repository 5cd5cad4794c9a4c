//! C10 — Config: environment-driven configuration, loaded once at startup.
//! Never panics on a missing or malformed variable.

use std::env;

use crate::scanner::ScannerConfig;

#[derive(Debug, Clone)]
pub struct R2Config {
    pub account_id: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub bucket: String,
    pub public_url: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub redis_url: String,
    pub poll_interval_ms: u64,
    pub max_concurrent_sources: usize,
    pub worker_concurrency: usize,
    pub scanner: ScannerConfig,
    pub r2: Option<R2Config>,
    pub user_agent: Option<String>,
    pub port: u16,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = env::var("DATABASE_URL").map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
        let redis_url = env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string());

        let poll_interval_ms = parse_env_or("INGEST_POLL_INTERVAL_MS", 600_000)?;
        let max_pages_per_run = parse_env_or("INGEST_MAX_PAGES_PER_RUN", 10)?;
        let max_items_per_run = parse_env_or("INGEST_MAX_ITEMS_PER_RUN", 100)?;
        let max_concurrent_sources = parse_env_or("INGEST_MAX_CONCURRENT_SOURCES", 10)?;
        let worker_concurrency = parse_env_or("INGEST_WORKER_CONCURRENCY", 5)?;

        let scanner = ScannerConfig {
            max_pages_per_run,
            max_items_per_run: max_items_per_run as u32,
            scan_timeout_ms: 300_000,
            max_duration_ms: 600_000,
            max_item_age_ms: 0,
        };

        let r2 = load_r2_config()?;

        let user_agent = env::var("INGEST_USER_AGENT").ok();
        let port = parse_env_or("PORT", 8080u16)?;

        Ok(Self {
            database_url,
            redis_url,
            poll_interval_ms,
            max_concurrent_sources: max_concurrent_sources as usize,
            worker_concurrency: worker_concurrency as usize,
            scanner,
            r2,
            user_agent,
            port,
        })
    }
}

/// The R2/S3 sink is all-or-nothing: if any of the five variables is set,
/// all five must be set, otherwise the CDN sink stays disabled.
fn load_r2_config() -> anyhow::Result<Option<R2Config>> {
    let vars = [
        "R2_ACCOUNT_ID",
        "R2_ACCESS_KEY_ID",
        "R2_SECRET_ACCESS_KEY",
        "R2_BUCKET",
        "R2_PUBLIC_URL",
    ];
    let present: Vec<Option<String>> = vars.iter().map(|v| env::var(v).ok()).collect();
    let any_present = present.iter().any(Option::is_some);
    if !any_present {
        return Ok(None);
    }
    let all_present = present.iter().all(Option::is_some);
    if !all_present {
        anyhow::bail!("R2_* variables must be set together (CDN sink is all-or-nothing)");
    }

    Ok(Some(R2Config {
        account_id: present[0].clone().unwrap(),
        access_key_id: present[1].clone().unwrap(),
        secret_access_key: present[2].clone().unwrap(),
        bucket: present[3].clone().unwrap(),
        public_url: present[4].clone().unwrap(),
    }))
}

fn parse_env_or<T: std::str::FromStr>(key: &str, default: T) -> anyhow::Result<T>
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw.parse().map_err(|e| anyhow::anyhow!("invalid value for {key}: {e}")),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_r2_vars() {
        for v in ["R2_ACCOUNT_ID", "R2_ACCESS_KEY_ID", "R2_SECRET_ACCESS_KEY", "R2_BUCKET", "R2_PUBLIC_URL"] {
            std::env::remove_var(v);
        }
    }

    #[test]
    #[serial]
    fn r2_disabled_when_unset() {
        clear_r2_vars();
        assert!(load_r2_config().unwrap().is_none());
    }

    #[test]
    #[serial]
    fn r2_rejects_partial_config() {
        clear_r2_vars();
        std::env::set_var("R2_ACCOUNT_ID", "acct");
        let result = load_r2_config();
        clear_r2_vars();
        assert!(result.is_err());
    }

    #[test]
    #[serial]
    fn r2_enabled_when_fully_set() {
        clear_r2_vars();
        std::env::set_var("R2_ACCOUNT_ID", "acct");
        std::env::set_var("R2_ACCESS_KEY_ID", "key");
        std::env::set_var("R2_SECRET_ACCESS_KEY", "secret");
        std::env::set_var("R2_BUCKET", "bucket");
        std::env::set_var("R2_PUBLIC_URL", "https://cdn.example.com");
        let result = load_r2_config().unwrap();
        clear_r2_vars();
        assert!(result.is_some());
    }

    #[test]
    #[serial]
    fn parse_env_or_falls_back_on_missing() {
        std::env::remove_var("INGEST_TEST_VALUE");
        let v: u64 = parse_env_or("INGEST_TEST_VALUE", 42).unwrap();
        assert_eq!(v, 42);
    }
}
