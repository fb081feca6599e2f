use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, bail};

use pairline_gateway::ServiceConfig;

/// Placeholder JWT secrets that MUST NOT be used.
const PLACEHOLDER_SECRETS: &[&str] = &[
    "change-me-to-a-random-string",
    "dev-secret-change-me",
];

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub jwt_secret: String,
    pub subscriber_queue: usize,
    pub backfill_page: u32,
    pub history_limit: u32,
}

impl ServerConfig {
    /// Read `PAIRLINE_*` variables from the process environment.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let jwt_secret = lookup("PAIRLINE_JWT_SECRET").unwrap_or_default();
        if jwt_secret.is_empty() || PLACEHOLDER_SECRETS.contains(&jwt_secret.as_str()) {
            bail!("PAIRLINE_JWT_SECRET is unset or still a placeholder; it must match the identity provider's signing secret");
        }

        Ok(Self {
            host: lookup("PAIRLINE_HOST").unwrap_or_else(|| "0.0.0.0".into()),
            port: parse_or(&lookup, "PAIRLINE_PORT", 3000)?,
            db_path: lookup("PAIRLINE_DB_PATH")
                .unwrap_or_else(|| "pairline.db".into())
                .into(),
            jwt_secret,
            subscriber_queue: parse_or(&lookup, "PAIRLINE_SUBSCRIBER_QUEUE", 256)?,
            backfill_page: parse_or(&lookup, "PAIRLINE_BACKFILL_PAGE", 100)?,
            history_limit: parse_or(&lookup, "PAIRLINE_HISTORY_LIMIT", 200)?,
        })
    }

    pub fn addr(&self) -> anyhow::Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("invalid listen address {}:{}", self.host, self.port))
    }

    pub fn service_config(&self) -> ServiceConfig {
        ServiceConfig {
            subscriber_queue: self.subscriber_queue,
            backfill_page: self.backfill_page,
        }
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{} has an invalid value '{}'", key, raw)),
        None => Ok(default),
    }
}
