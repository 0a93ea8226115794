use std::fmt;
use std::time::Duration;

use anyhow::Result;
use config::builder::DefaultState;
use config::{Config, ConfigBuilder, Environment, File, FileFormat};
use serde::Deserialize;
use url::Url;

use crate::error::{CoreError, CoreResult};

/// Prefix for environment variables, e.g. `TXGUARD_DATABASE__POOL__MAX_SIZE`.
pub const ENV_PREFIX: &str = "TXGUARD";

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatabaseDriver {
    #[serde(alias = "postgresql", alias = "pg")]
    Postgres,
}

#[derive(Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub driver: DatabaseDriver,
    pub pool: PoolConfig,
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("url", &redact_url(&self.url))
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| REDACTED))
            .field("driver", &self.driver)
            .field("pool", &self.pool)
            .finish()
    }
}

impl DatabaseConfig {
    /// ## Summary
    /// Returns the URL handed to the driver.
    ///
    /// When `username` is set and the URL carries no credentials of its own,
    /// the username and password are added to the userinfo section
    /// (percent-encoded). Credentials already present in the URL win, and a
    /// URL that does not parse is returned unchanged for the driver to reject.
    #[must_use]
    pub fn connection_url(&self) -> String {
        let Some(username) = self.username.as_deref() else {
            return self.url.clone();
        };
        let Ok(mut url) = Url::parse(&self.url) else {
            return self.url.clone();
        };
        if !url.username().is_empty() || url.password().is_some() {
            return self.url.clone();
        }

        if url.set_username(username).is_err()
            || url.set_password(self.password.as_deref()).is_err()
        {
            return self.url.clone();
        }

        url.into()
    }
}

/// Pool sizing and timing parameters.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PoolConfig {
    pub max_size: u32,
    pub min_idle: u32,
    pub idle_timeout_ms: u64,
    pub connection_timeout_ms: u64,
    pub max_lifetime_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 10,
            min_idle: 2,
            idle_timeout_ms: 30_000,
            connection_timeout_ms: 30_000,
            max_lifetime_ms: 1_800_000,
        }
    }
}

impl PoolConfig {
    #[must_use]
    pub const fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    #[must_use]
    pub const fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    #[must_use]
    pub const fn max_lifetime(&self) -> Duration {
        Duration::from_millis(self.max_lifetime_ms)
    }

    /// ## Summary
    /// Checks that the pool is bounded and `min_idle <= max_size`.
    ///
    /// ## Errors
    /// Returns `CoreError::InvalidConfiguration` describing the first violated bound.
    pub fn validate(&self) -> CoreResult<()> {
        if self.max_size == 0 {
            return Err(CoreError::InvalidConfiguration(
                "database.pool.max_size must be greater than zero".to_string(),
            ));
        }
        if self.min_idle > self.max_size {
            return Err(CoreError::InvalidConfiguration(format!(
                "database.pool.min_idle ({}) exceeds database.pool.max_size ({})",
                self.min_idle, self.max_size
            )));
        }
        if self.connection_timeout_ms == 0 {
            return Err(CoreError::InvalidConfiguration(
                "database.pool.connection_timeout_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl Settings {
    /// ## Summary
    /// Loads configuration from `config.toml` (optional) and environment variables.
    /// Environment variables take precedence over file values.
    ///
    /// ## Errors
    /// Returns an error if building the configuration or deserializing it fails.
    pub fn load() -> Result<Self> {
        let config = defaults()?
            .add_source(File::with_name("config.toml").required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .ignore_empty(true)
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize::<Self>()?)
    }

    /// ## Summary
    /// Loads configuration from an inline TOML document layered over the defaults.
    ///
    /// ## Errors
    /// Returns an error if the document is malformed or a required key is missing.
    pub fn from_toml_str(toml: &str) -> Result<Self> {
        Ok(defaults()?
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()?
            .try_deserialize::<Self>()?)
    }
}

fn defaults() -> CoreResult<ConfigBuilder<DefaultState>> {
    let pool = PoolConfig::default();

    Ok(Config::builder()
        .set_default("database.driver", "postgres")?
        .set_default("database.pool.max_size", pool.max_size)?
        .set_default("database.pool.min_idle", pool.min_idle)?
        .set_default("database.pool.idle_timeout_ms", pool.idle_timeout_ms)?
        .set_default(
            "database.pool.connection_timeout_ms",
            pool.connection_timeout_ms,
        )?
        .set_default("database.pool.max_lifetime_ms", pool.max_lifetime_ms)?
        .set_default("logging.level", "info")?)
}

/// ## Summary
/// Loads configuration from environment variables and `.env` file.
///
/// ## Errors
/// Returns an error if loading or deserializing the configuration fails.
pub fn load_config() -> Result<Settings> {
    if let Err(error) = dotenvy::dotenv() {
        tracing::debug!(%error, "No .env file loaded");
    }

    Settings::load()
}

const REDACTED: &str = "REDACTED";

fn redact_url(raw: &str) -> String {
    let Ok(mut url) = Url::parse(raw) else {
        return REDACTED.to_string();
    };

    if url.password().is_some() && url.set_password(Some(REDACTED)).is_err() {
        return REDACTED.to_string();
    }

    let mut has_password_param = false;
    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(key, value)| {
            if key.eq_ignore_ascii_case("password") {
                has_password_param = true;
                (key.into_owned(), REDACTED.to_string())
            } else {
                (key.into_owned(), value.into_owned())
            }
        })
        .collect();
    if has_password_param {
        url.query_pairs_mut().clear().extend_pairs(pairs);
    }

    url.into()
}
