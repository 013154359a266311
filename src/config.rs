//! Configuration management
//!
//! Loads configuration from:
//! 1. Default values
//! 2. Configuration files (config/default.toml, config/local.toml)
//! 3. Environment variables (FEDSERVE__*, override)

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::data::validate_identifier;
use crate::error::AppError;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub federation: FederationConfig,
    pub storage: StorageConfig,
    /// Local actors created or refreshed at startup
    #[serde(default)]
    pub actors: Vec<ActorConfig>,
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Port number (e.g., 8080)
    pub port: u16,
}

/// Federation behaviour
#[derive(Debug, Clone, Deserialize)]
pub struct FederationConfig {
    /// Public base URL; actor IRIs are `base_url + name`
    pub base_url: String,
    /// Sent as the User-Agent of every outbound request
    pub user_agent: String,
    /// Per-request timeout for outbound HTTP
    pub request_timeout_secs: u64,
    /// Require a valid HTTP signature on inbox POSTs
    pub verify_signatures: bool,
    pub accept_correlation: AcceptCorrelation,
    /// Deliver to a follower's shared inbox when one is advertised
    pub shared_inbox_delivery: bool,
    pub delivery: DeliveryConfig,
}

impl FederationConfig {
    /// Base URL guaranteed to end with `/`.
    pub fn normalized_base_url(&self) -> String {
        if self.base_url.ends_with('/') {
            self.base_url.clone()
        } else {
            format!("{}/", self.base_url)
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// How an inbound Accept is matched against the pending Follow
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum AcceptCorrelation {
    /// Any Accept from a requested remote completes the follow; id mismatches are logged
    #[default]
    Lenient,
    /// The embedded Follow id must equal the one sent
    Strict,
}

/// Retry policy for outbound deliveries
#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryConfig {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_secs: u64,
    pub multiplier: f64,
    /// Upper bound on simultaneous outbound POSTs
    pub max_concurrent: usize,
}

/// Storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Root directory holding `actors/` and `foreign/`
    pub root: PathBuf,
}

/// A local actor to bootstrap
#[derive(Debug, Clone, Deserialize)]
pub struct ActorConfig {
    pub name: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default = "default_actor_type")]
    pub actor_type: String,
}

fn default_actor_type() -> String {
    "Person".to_string()
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// Log format: "pretty" or "json"
    pub format: String,
}

impl AppConfig {
    /// Load configuration from file and environment
    ///
    /// # Loading Order
    /// 1. Default values
    /// 2. config/default.toml (if exists)
    /// 3. config/local.toml (if exists)
    /// 4. Environment variables (FEDSERVE__*)
    ///
    /// # Errors
    /// Returns error if configuration is invalid
    pub fn load() -> Result<Self, AppError> {
        use config::{Config, Environment, File};

        let config = Config::builder()
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 8080)?
            .set_default("federation.base_url", "http://localhost:8080/")?
            .set_default(
                "federation.user_agent",
                concat!("fedserve/", env!("CARGO_PKG_VERSION")),
            )?
            .set_default("federation.request_timeout_secs", 30)?
            .set_default("federation.verify_signatures", true)?
            .set_default("federation.accept_correlation", "lenient")?
            .set_default("federation.shared_inbox_delivery", true)?
            .set_default("federation.delivery.max_retries", 5)?
            .set_default("federation.delivery.initial_delay_ms", 1000)?
            .set_default("federation.delivery.max_delay_secs", 300)?
            .set_default("federation.delivery.multiplier", 2.0)?
            .set_default("federation.delivery.max_concurrent", 10)?
            .set_default("storage.root", "storage")?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(
                Environment::with_prefix("FEDSERVE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| AppError::Config(e.to_string()))?;

        let app_config: Self = config
            .try_deserialize()
            .map_err(|e| AppError::Config(e.to_string()))?;
        app_config.validate()?;
        Ok(app_config)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        let base = url::Url::parse(&self.federation.base_url)
            .map_err(|e| AppError::Config(format!("federation.base_url is invalid: {}", e)))?;
        if !matches!(base.scheme(), "http" | "https") || base.host_str().is_none() {
            return Err(AppError::Config(
                "federation.base_url must be an absolute http(s) URL".to_string(),
            ));
        }

        if self.federation.user_agent.trim().is_empty() {
            return Err(AppError::Config(
                "federation.user_agent must not be empty".to_string(),
            ));
        }

        let delivery = &self.federation.delivery;
        if delivery.multiplier < 1.0 {
            return Err(AppError::Config(
                "federation.delivery.multiplier must be at least 1.0".to_string(),
            ));
        }
        if delivery.max_concurrent == 0 {
            return Err(AppError::Config(
                "federation.delivery.max_concurrent must be greater than 0".to_string(),
            ));
        }

        for actor in &self.actors {
            validate_identifier(&actor.name)
                .map_err(|_| AppError::Config(format!("illegal actor name {:?}", actor.name)))?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> AppConfig {
        AppConfig {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            federation: FederationConfig {
                base_url: "https://social.example".to_string(),
                user_agent: "fedserve/test".to_string(),
                request_timeout_secs: 30,
                verify_signatures: true,
                accept_correlation: AcceptCorrelation::Lenient,
                shared_inbox_delivery: true,
                delivery: DeliveryConfig {
                    max_retries: 5,
                    initial_delay_ms: 1000,
                    max_delay_secs: 300,
                    multiplier: 2.0,
                    max_concurrent: 10,
                },
            },
            storage: StorageConfig {
                root: PathBuf::from("/tmp/fedserve-test"),
            },
            actors: vec![ActorConfig {
                name: "alice".to_string(),
                summary: "hello".to_string(),
                actor_type: "Person".to_string(),
            }],
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "pretty".to_string(),
            },
        }
    }

    #[test]
    fn validate_accepts_default_shape() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn base_url_gains_trailing_slash() {
        let config = valid_config();
        assert_eq!(
            config.federation.normalized_base_url(),
            "https://social.example/"
        );
    }

    #[test]
    fn validate_rejects_relative_base_url() {
        let mut config = valid_config();
        config.federation.base_url = "social.example".to_string();

        let error = config.validate().expect_err("relative base url must fail");
        assert!(matches!(
            error,
            AppError::Config(message) if message.contains("federation.base_url")
        ));
    }

    #[test]
    fn validate_rejects_unsafe_actor_name() {
        let mut config = valid_config();
        config.actors[0].name = "../alice".to_string();

        let error = config.validate().expect_err("traversal name must fail");
        assert!(matches!(
            error,
            AppError::Config(message) if message.contains("illegal actor name")
        ));
    }

    #[test]
    fn validate_rejects_shrinking_backoff() {
        let mut config = valid_config();
        config.federation.delivery.multiplier = 0.5;

        assert!(config.validate().is_err());
    }
}
