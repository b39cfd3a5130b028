//! Application configuration module
//!
//! Handles loading and validating configuration from `.env`, an optional
//! `envclone.toml` file and `ENVCLONE__*` environment variables.

use serde::Deserialize;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),

    #[error("Failed to parse configuration: {0}")]
    ParseError(#[from] config::ConfigError),
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: Ipv4Addr,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: Ipv4Addr::new(0, 0, 0, 0), // Bind to 0.0.0.0 for Docker
            port: 3000,
        }
    }
}

/// Durable state database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    pub max_pool_size: usize,
    pub require_tls: bool,
}

/// CORS configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CorsConfig {
    pub allowed_origins: Vec<String>,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: vec!["http://localhost:3001".to_string()],
        }
    }
}

/// Clone engine configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CloneConfig {
    /// Directory holding backup artifacts
    pub backup_dir: PathBuf,
    /// Directory for the file state store (used when no DATABASE_URL is set)
    pub state_dir: PathBuf,
    /// Number of security alerts kept in memory
    pub alert_retention: usize,
    /// Backups kept per environment before pruning
    pub backup_retention: usize,
    /// Default per-operation timeout
    pub operation_timeout_secs: u64,
    /// Rows copied per batch during the data phase
    pub batch_size: usize,
    /// Host/database substrings that mark a connection as production
    pub production_host_patterns: Vec<String>,
    /// Display-name substrings that mark an environment as production
    pub production_name_markers: Vec<String>,
    /// Salt mixed into hashed anonymization values
    pub anonymization_salt: String,
}

impl Default for CloneConfig {
    fn default() -> Self {
        Self {
            backup_dir: PathBuf::from("./data/backups"),
            state_dir: PathBuf::from("./data/state"),
            alert_retention: 1000,
            backup_retention: 10,
            operation_timeout_secs: 300,
            batch_size: 1000,
            production_host_patterns: vec![
                "prod".to_string(),
                "production".to_string(),
                "prd".to_string(),
                "live".to_string(),
            ],
            production_name_markers: vec![
                "prod".to_string(),
                "production".to_string(),
                "prd".to_string(),
                "live".to_string(),
            ],
            anonymization_salt: String::new(),
        }
    }
}

/// Authentication configuration
#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub jwt_secret: String,
}

/// Complete application settings
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerConfig,
    pub database: Option<DatabaseConfig>,
    pub cors: CorsConfig,
    pub clone: CloneConfig,
    pub auth: AuthConfig,
}

impl Settings {
    /// Load settings from the environment and the optional config file
    pub fn load() -> Result<Self, ConfigError> {
        // Load .env file if it exists (ignore errors if file not found)
        let _ = dotenvy::dotenv();

        let server = ServerConfig {
            host: std::env::var("HOST")
                .ok()
                .and_then(|h| h.parse().ok())
                .unwrap_or_else(|| ServerConfig::default().host),
            port: std::env::var("PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or_else(|| ServerConfig::default().port),
        };

        let database = match std::env::var("DATABASE_URL") {
            Ok(url) => Some(Self::parse_database_url(&url)?),
            Err(_) => None,
        };

        let cors = CorsConfig {
            allowed_origins: std::env::var("ALLOWED_ORIGINS")
                .ok()
                .map(|s| s.split(',').map(|s| s.trim().to_string()).collect())
                .unwrap_or_else(|| CorsConfig::default().allowed_origins),
        };

        let clone = Self::load_clone_config()?;

        let auth = AuthConfig {
            jwt_secret: std::env::var("JWT_SECRET").unwrap_or_else(|_| {
                tracing::warn!("⚠️  JWT_SECRET not set, using default (INSECURE - set in production!)");
                "envclone-dev-secret-change-in-production".to_string()
            }),
        };

        Ok(Self {
            server,
            database,
            cors,
            clone,
            auth,
        })
    }

    /// Layer the optional `envclone.toml` file and `ENVCLONE__*` variables over defaults
    fn load_clone_config() -> Result<CloneConfig, ConfigError> {
        let layered = config::Config::builder()
            .add_source(config::File::with_name("envclone").required(false))
            .add_source(
                config::Environment::with_prefix("ENVCLONE")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("production_host_patterns")
                    .with_list_parse_key("production_name_markers")
                    .try_parsing(true),
            )
            .build()?;

        let clone: CloneConfig = layered.try_deserialize()?;
        clone.validate()?;
        Ok(clone)
    }

    /// Parse a DATABASE_URL connection string (postgresql://...)
    fn parse_database_url(url: &str) -> Result<DatabaseConfig, ConfigError> {
        let parsed = url::Url::parse(url).map_err(|_| {
            ConfigError::InvalidValue(
                "Invalid DATABASE_URL format (expected postgresql://...)".to_string(),
            )
        })?;

        let host = parsed
            .host_str()
            .ok_or_else(|| ConfigError::InvalidValue("Missing host in DATABASE_URL".to_string()))?
            .to_string();

        let database = parsed.path().trim_start_matches('/').to_string();
        if database.is_empty() {
            return Err(ConfigError::InvalidValue(
                "Missing database name in DATABASE_URL".to_string(),
            ));
        }

        Ok(DatabaseConfig {
            require_tls: host.contains("neon.tech") || url.contains("sslmode=require"),
            host,
            port: parsed.port().unwrap_or(5432),
            user: parsed.username().to_string(),
            password: parsed.password().map(|p| p.to_string()).unwrap_or_default(),
            database,
            max_pool_size: std::env::var("DB_MAX_CONNECTIONS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(10),
        })
    }
}

impl CloneConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.alert_retention == 0 {
            return Err(ConfigError::InvalidValue(
                "alert_retention must be at least 1".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::InvalidValue(
                "batch_size must be at least 1".to_string(),
            ));
        }
        if self.operation_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "operation_timeout_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
