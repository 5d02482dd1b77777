use crate::refresh::{DEFAULT_FRESH_FOR, RefreshConfig};
use anyhow::{Context, Result};
use std::env;
use std::time::Duration;

const DEFAULT_PORT: u16 = 8081;
const DEFAULT_CACHE_TTL_SECS: u64 = 7 * 24 * 3600;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub database_url: String,
    pub goodreads_api_key: String,
    /// Set to use the shared Redis cache; unset means in-process.
    pub redis_url: Option<String>,
    pub cache_ttl: Duration,
    pub refresh: RefreshConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let port = match env::var("PORT") {
            Ok(raw) => raw
                .parse()
                .with_context(|| format!("PORT is not a valid port number: {raw}"))?,
            Err(_) => DEFAULT_PORT,
        };

        let database_url = env::var("DATABASE_URL").context("missing DATABASE_URL")?;
        let goodreads_api_key =
            env::var("GOODREADS_API_KEY").context("missing GOODREADS_API_KEY")?;
        let redis_url = env::var("REDIS_URL").ok();

        let cache_ttl = Duration::from_secs(parse_secs("CACHE_TTL_SECS", DEFAULT_CACHE_TTL_SECS)?);
        let fresh_for =
            Duration::from_secs(parse_secs("REFRESH_FRESH_SECS", DEFAULT_FRESH_FOR.as_secs())?);

        Ok(Self {
            port,
            database_url,
            goodreads_api_key,
            redis_url,
            cache_ttl,
            refresh: RefreshConfig {
                fresh_for,
                ..RefreshConfig::default()
            },
        })
    }
}

fn parse_secs(var: &str, default: u64) -> Result<u64> {
    match env::var(var) {
        Ok(raw) => raw
            .parse()
            .with_context(|| format!("{var} is not a valid number of seconds: {raw}")),
        Err(_) => Ok(default),
    }
}
