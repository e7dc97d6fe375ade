//! Configuration management

use anyhow::Result;
use serde::Deserialize;

/// Default configuration file, overridable through `NINJA_CONFIG`
const DEFAULT_CONFIG_PATH: &str = "config.toml";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub geoip: GeoIpConfig,
    pub aggregation: AggregationConfig,
    pub identity: IdentityConfig,
    pub stats: StatsConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    /// Public domain the beacon script posts back to
    pub domain: String,
    pub port: u16,
    /// Honour X-Real-IP / X-Forwarded-For. Only enable behind a reverse proxy.
    #[serde(default)]
    pub trust_proxy_headers: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path of the SQLite database file
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    8
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeoIpConfig {
    pub database: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AggregationConfig {
    pub interval_secs: u64,
    /// Upper bound on past days folded by a single run
    pub max_days_per_run: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IdentityConfig {
    #[serde(default)]
    pub salt: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatsConfig {
    /// Historical stats cache lifetime; 0 disables caching
    pub cache_ttl_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path =
            std::env::var("NINJA_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(&config_path)
    }

    /// Layer defaults, the optional config file and `NINJA_*` environment variables
    pub fn load_from(config_path: &str) -> Result<Self> {
        let builder = config::Config::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.domain", "localhost")?
            .set_default("server.port", 8080_i64)?
            .set_default("server.trust_proxy_headers", false)?
            .set_default("database.url", "ninja.db")?
            .set_default("database.max_connections", 8_i64)?
            .set_default("geoip.database", "GeoLite2-City.mmdb")?
            .set_default("aggregation.interval_secs", 3600_i64)?
            .set_default("aggregation.max_days_per_run", 31_i64)?
            .set_default("identity.salt", "")?
            .set_default("stats.cache_ttl_secs", 60_i64)?
            .set_default("logging.level", "info")?
            .add_source(config::File::with_name(config_path).required(false))
            .add_source(
                config::Environment::with_prefix("NINJA")
                    .separator("__")
                    .try_parsing(true),
            );

        let settings = builder.build()?;
        let config: Config = settings.try_deserialize()?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            anyhow::bail!("Invalid port: 0 is not allowed");
        }
        if self.server.domain.is_empty() {
            anyhow::bail!("Server domain cannot be empty");
        }

        if self.database.url.is_empty() {
            anyhow::bail!("Database URL cannot be empty");
        }
        if self.database.max_connections == 0 {
            anyhow::bail!("database.max_connections must be at least 1");
        }

        if self.aggregation.interval_secs == 0 {
            anyhow::bail!("aggregation.interval_secs must be positive");
        }
        if self.aggregation.max_days_per_run == 0 {
            anyhow::bail!("aggregation.max_days_per_run must be positive");
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid logging level '{}'. Must be one of: {:?}",
                self.logging.level,
                valid_levels
            );
        }

        Ok(())
    }

    /// Address the HTTP listener binds to
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
