use serde::Deserialize;
use std::time::Duration;

/// Main configuration for the asset delivery service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    pub service: ServiceConfig,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Object storage configuration
    pub storage: StorageConfig,
    /// Visit statistics configuration
    pub stats: StatsConfig,
    /// API configuration
    pub api: ApiConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Run migrations on startup
    #[serde(default = "default_run_migrations")]
    pub run_migrations: bool,
}

/// Object storage (S3) configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Bucket holding asset sources and renditions
    pub bucket: String,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
    /// Presigned download URL expiration in seconds
    #[serde(default = "default_presigned_url_expiry_secs")]
    pub presigned_url_expiry_secs: u64,
}

/// Visit ledger / counter folding configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StatsConfig {
    /// Interval between counter folding runs, in seconds
    #[serde(default = "default_fold_interval_secs")]
    pub fold_interval_secs: u64,
}

/// HTTP API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed CORS origins
    #[serde(default)]
    pub cors_origins: Vec<String>,
    /// Trust the X-Forwarded-For header for client IP resolution.
    /// Enable only behind a proxy that overwrites the header.
    #[serde(default = "default_true")]
    pub trust_forwarded_for: bool,
}

// Default value functions
fn default_service_name() -> String {
    "asset-delivery-service".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_presigned_url_expiry_secs() -> u64 {
    900
}

fn default_fold_interval_secs() -> u64 {
    3600
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_run_migrations() -> bool {
    true
}

fn default_true() -> bool {
    true
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Start with default values
            .set_default("service.name", "asset-delivery-service")?
            .set_default("service.log_level", "info")?
            .set_default("service.metrics_port", 9090)?
            // Add config file if present
            .add_source(config::File::with_name("config/delivery").required(false))
            .add_source(config::File::with_name("/etc/studio/delivery").required(false))
            // Override with environment variables
            // DELIVERY__DATABASE__URL -> database.url
            .add_source(
                config::Environment::with_prefix("DELIVERY")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }

    /// Get counter fold interval as Duration
    pub fn fold_interval(&self) -> Duration {
        Duration::from_secs(self.stats.fold_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        assert_eq!(default_fold_interval_secs(), 3600);
        assert_eq!(default_presigned_url_expiry_secs(), 900);
        assert_eq!(default_api_port(), 8080);
    }

    #[test]
    fn test_fold_interval_helper() {
        let config = Config {
            service: ServiceConfig {
                name: default_service_name(),
                log_level: default_log_level(),
                metrics_port: default_metrics_port(),
            },
            database: DatabaseConfig {
                url: "postgres://localhost/studio".to_string(),
                max_connections: 10,
                min_connections: 2,
                connect_timeout_secs: 30,
                idle_timeout_secs: 600,
                run_migrations: true,
            },
            storage: StorageConfig {
                bucket: "studio-assets".to_string(),
                region: default_region(),
                endpoint_url: None,
                force_path_style: false,
                presigned_url_expiry_secs: 900,
            },
            stats: StatsConfig {
                fold_interval_secs: 3600,
            },
            api: ApiConfig {
                host: default_api_host(),
                port: default_api_port(),
                cors_enabled: true,
                cors_origins: vec![],
                trust_forwarded_for: true,
            },
        };

        assert_eq!(config.fold_interval(), Duration::from_secs(3600));
    }
}
