use serde::Deserialize;

use crate::dialect::DEFAULT_SCHEMA;
use crate::error::{NebulaError, NebulaResult};

/// Connection settings for an [`Executor`](crate::Executor).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// sqlx connection URL, e.g. `sqlite:app.db` or `sqlite::memory:`.
    pub url: String,
    /// Schema used to qualify table names.
    pub schema: String,
    pub max_connections: u32,
    /// Record every statement in the executor's query log.
    pub log_queries: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite:nebula.db".to_owned(),
            schema: DEFAULT_SCHEMA.to_owned(),
            max_connections: 5,
            log_queries: false,
        }
    }
}

impl DatabaseConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Reads `DATABASE_URL`, `DB_SCHEMA`, `DB_MAX_CONNECTIONS` and
    /// `DB_LOG_QUERIES`, falling back to the defaults for unset variables.
    pub fn from_env() -> NebulaResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> NebulaResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(url) = lookup("DATABASE_URL") {
            config.url = url;
        }
        if let Some(schema) = lookup("DB_SCHEMA") {
            config.schema = schema;
        }
        if let Some(raw) = lookup("DB_MAX_CONNECTIONS") {
            config.max_connections = raw.trim().parse().map_err(|_| {
                NebulaError::Config(format!("DB_MAX_CONNECTIONS must be a number, got `{}`", raw))
            })?;
            if config.max_connections == 0 {
                return Err(NebulaError::Config(
                    "DB_MAX_CONNECTIONS must be at least 1".to_owned(),
                ));
            }
        }
        if let Some(raw) = lookup("DB_LOG_QUERIES") {
            config.log_queries = matches!(
                raw.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            );
        }
        Ok(config)
    }
}
