use anyhow::{Context, Result};
use serde::Deserialize;
use std::time::Duration;

/// `AppConfig` holds all configuration parameters required by the application.
///
/// Values are resolved in this order, later sources winning: built-in defaults,
/// a `.env` file, environment variables, and finally [`Overrides`] coming from
/// the command line.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct AppConfig {
    // --- HTTP server ---
    /// Address the HTTP server binds to (e.g. "0.0.0.0:8080").
    pub run_address: String,
    /// Header carrying the caller identity resolved by the authenticating gateway.
    pub auth_header: String,

    // --- Storage ---
    /// PostgreSQL connection string. Empty selects the in-memory store.
    pub database_uri: String,
    /// Maximum number of pooled database connections.
    pub db_max_connections: usize,
    /// Directory with `*.sql` migrations applied at startup.
    pub migrations_dir: String,

    // --- Accrual system ---
    /// Base URL of the accrual calculation service.
    pub accrual_system_address: String,
    /// Upper bound for a single accrual query.
    #[serde(deserialize_with = "deserialize_duration")]
    pub accrual_timeout: Duration,
    /// Pause applied when the accrual service rate-limits without a usable `Retry-After`.
    #[serde(deserialize_with = "deserialize_duration")]
    pub accrual_retry_after: Duration,

    // --- Poller ---
    /// Delay between polling cycles.
    #[serde(deserialize_with = "deserialize_duration")]
    pub poll_interval: Duration,
    /// Maximum number of orders examined per cycle.
    pub poll_batch_size: usize,
    /// Maximum number of accrual queries in flight at once.
    pub poll_concurrency: usize,
    /// Wait before an order still pending after a query is queried again.
    #[serde(deserialize_with = "deserialize_duration")]
    pub poll_retry_backoff: Duration,

    // --- Shutdown timeout ---
    /// Graceful shutdown timeout (human-friendly format, e.g. "5s", "1m").
    #[serde(deserialize_with = "deserialize_duration")]
    pub shutdown_timeout: Duration,
}

/// Command-line values that take precedence over every other source.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub run_address: Option<String>,
    pub database_uri: Option<String>,
    pub accrual_system_address: Option<String>,
}

/// Accepts human-readable durations like "500ms", "5s", "1m".
fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;
    let val = String::deserialize(deserializer)?;
    humantime::parse_duration(&val)
        .map_err(|e| D::Error::custom(format!("Invalid duration '{val}': {e}")))
}

impl AppConfig {
    /// Loads configuration from defaults, `.env` and environment variables.
    ///
    /// # Errors
    /// Returns an error if environment variables hold values of the wrong type.
    pub fn load() -> Result<Self> {
        Self::load_with(Overrides::default())
    }

    /// Same as [`AppConfig::load`], with command-line overrides applied last.
    ///
    /// # Errors
    /// Returns an error if any source holds values of the wrong type.
    pub fn load_with(overrides: Overrides) -> Result<Self> {
        dotenvy::dotenv().ok();

        let settings = config::Config::builder()
            // HTTP
            .set_default("run_address", "0.0.0.0:8080")?
            .set_default("auth_header", "x-user-id")?
            // Storage
            .set_default("database_uri", "")?
            .set_default("db_max_connections", 16)?
            .set_default("migrations_dir", "migrations")?
            // Accrual system
            .set_default("accrual_system_address", "http://localhost:8081")?
            .set_default("accrual_timeout", "5s")?
            .set_default("accrual_retry_after", "60s")?
            // Poller
            .set_default("poll_interval", "1s")?
            .set_default("poll_batch_size", 100)?
            .set_default("poll_concurrency", 8)?
            .set_default("poll_retry_backoff", "10s")?
            // Shutdown
            .set_default("shutdown_timeout", "5s")?
            .add_source(config::Environment::default().try_parsing(true))
            .set_override_option("run_address", overrides.run_address)?
            .set_override_option("database_uri", overrides.database_uri)?
            .set_override_option("accrual_system_address", overrides.accrual_system_address)?
            .build()?;

        settings
            .try_deserialize()
            .context("Failed to load configuration")
    }

    /// `true` when a PostgreSQL connection string is configured.
    pub fn uses_database(&self) -> bool {
        !self.database_uri.trim().is_empty()
    }
}
