use coin_ledger::config::{LedgerConfig, ReconciliationConfig, RouterConfig};
use config::{ConfigError, Environment, File};
use message_bus::SubscriberConfig;
use serde::{Deserialize, Serialize};
use std::env;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub nats: NatsConfig,
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub reconciliation: ReconciliationConfig,
    #[serde(default)]
    pub subscriber: SubscriberConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub workers: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DatabaseConfig {
    /// `postgres://...` or `memory://[?partitions=N]`
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct NatsConfig {
    pub url: String,
    /// Run the event router; off for API-only replicas
    pub enabled: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CatalogConfig {
    /// Base URL of the warrior directory
    pub url: String,
    pub timeout_ms: u64,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let environment = env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string());

        let mut builder = config::Config::builder()
            // Start with default configuration
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 50051)?
            .set_default("server.workers", 4)?
            .set_default("database.max_connections", 10)?
            .set_default("nats.url", "nats://localhost:4222")?
            .set_default("nats.enabled", true)?
            .set_default("catalog.url", "http://localhost:8080")?
            .set_default("catalog.timeout_ms", 2000)?;

        // Add environment-specific config file if it exists
        if let Ok(config_file) = env::var("CONFIG_FILE") {
            builder = builder.add_source(File::with_name(&config_file).required(false));
        } else {
            builder = builder.add_source(
                File::with_name(&format!("config/{}", environment)).required(false),
            );
        }

        // Override with environment variables
        builder = builder.add_source(
            Environment::with_prefix("COIN_ENGINE")
                .separator("__")
                .try_parsing(true),
        );

        // Special handling for common env vars
        if let Ok(db_url) = env::var("DATABASE_URL") {
            builder = builder.set_override("database.url", db_url)?;
        }

        if let Ok(nats_url) = env::var("NATS_URL") {
            builder = builder.set_override("nats.url", nats_url)?;
        }

        if let Ok(directory_url) = env::var("WARRIOR_DIRECTORY_URL") {
            builder = builder.set_override("catalog.url", directory_url)?;
        }

        if let Ok(port) = env::var("COIN_ENGINE_PORT") {
            builder = builder.set_override("server.port", port)?;
        }

        if let Ok(interval) = env::var("RECONCILE_INTERVAL_SECS") {
            builder = builder.set_override("reconciliation.interval_secs", interval)?;
        }

        builder.build()?.try_deserialize()
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.server.port == 0 {
            return Err("Server port cannot be 0".to_string());
        }

        if self.database.url.is_empty() {
            return Err("Database URL is required".to_string());
        }

        if self.nats.enabled && self.nats.url.is_empty() {
            return Err("NATS URL is required".to_string());
        }

        if self.catalog.url.is_empty() {
            return Err("Warrior directory URL is required".to_string());
        }

        if self.reconciliation.interval_secs == 0 {
            return Err("Reconciliation interval cannot be 0".to_string());
        }

        if self.ledger.default_history_limit > self.ledger.max_history_limit {
            return Err("Default history limit exceeds the maximum".to_string());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Config {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 50051,
                workers: 1,
            },
            database: DatabaseConfig {
                url: "memory://".to_string(),
                max_connections: 1,
            },
            nats: NatsConfig {
                url: "nats://localhost:4222".to_string(),
                enabled: false,
            },
            catalog: CatalogConfig {
                url: "http://localhost:8080".to_string(),
                timeout_ms: 100,
            },
            ledger: LedgerConfig::default(),
            router: RouterConfig::default(),
            reconciliation: ReconciliationConfig::default(),
            subscriber: SubscriberConfig::default(),
        }
    }

    #[test]
    fn test_validate() {
        assert!(sample().validate().is_ok());

        let mut config = sample();
        config.database.url.clear();
        assert!(config.validate().is_err());

        let mut config = sample();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = sample();
        config.reconciliation.interval_secs = 0;
        assert!(config.validate().is_err());
    }
}
