//! Configuration loader with layered sources.

use crate::AppConfig;
use config::{Config, ConfigError, Environment, File};
use grafto_core::{GraftoError, GraftoResult};
use std::path::Path;
use tracing::{debug, info, warn};

/// Loads [`AppConfig`] once at process start-up.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    config: AppConfig,
    config_dir: String,
}

impl ConfigLoader {
    /// Creates a new configuration loader.
    ///
    /// Configuration is loaded from multiple sources in order:
    /// 1. `config/default.toml` - Default values
    /// 2. `config/{environment}.toml` - Environment-specific overrides
    /// 3. `config/local.toml` - Uncommitted local overrides
    /// 4. Environment variables with `GRAFTO__` prefix
    pub fn new(config_dir: impl Into<String>) -> GraftoResult<Self> {
        let config_dir = config_dir.into();
        let config = Self::load_config(&config_dir)?;

        Ok(Self { config, config_dir })
    }

    /// Loads configuration from the default location (`./config`).
    pub fn from_default_location() -> GraftoResult<Self> {
        Self::new("./config")
    }

    /// Returns the loaded configuration.
    #[must_use]
    pub fn get(&self) -> &AppConfig {
        &self.config
    }

    /// Consumes the loader, returning the configuration.
    #[must_use]
    pub fn into_inner(self) -> AppConfig {
        self.config
    }

    /// Returns the directory the configuration was loaded from.
    #[must_use]
    pub fn config_dir(&self) -> &str {
        &self.config_dir
    }

    fn load_config(config_dir: &str) -> GraftoResult<AppConfig> {
        if let Err(e) = dotenvy::dotenv() {
            debug!("No .env file found or error loading it: {}", e);
        }

        let environment =
            std::env::var("GRAFTO_ENVIRONMENT").unwrap_or_else(|_| "development".to_string());

        info!("Loading configuration for environment: {}", environment);

        let mut builder = Config::builder();

        for name in ["default", environment.as_str(), "local"] {
            let path = format!("{}/{}.toml", config_dir, name);
            if Path::new(&path).exists() {
                debug!("Loading config from: {}", path);
                builder = builder.add_source(File::with_name(&path).required(false));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("GRAFTO")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build().map_err(config_error_to_grafto_error)?;

        let mut app_config: AppConfig = config
            .try_deserialize()
            .map_err(config_error_to_grafto_error)?;
        app_config.app.environment = environment;

        validate_config(&app_config)?;

        Ok(app_config)
    }
}

/// Rejects configurations the worker cannot run with.
pub fn validate_config(config: &AppConfig) -> GraftoResult<()> {
    if config.database.url.is_empty() {
        return Err(GraftoError::configuration("Database URL is required"));
    }

    let queue = &config.jobs.queue;
    if queue.batch_size == 0 {
        return Err(GraftoError::configuration("jobs.queue.batch_size must be greater than zero"));
    }
    if queue.max_retries == 0 {
        return Err(GraftoError::configuration("jobs.queue.max_retries must be greater than zero"));
    }
    if queue.backoff.initial_delay_ms == 0 {
        return Err(GraftoError::configuration(
            "jobs.queue.backoff.initial_delay_ms must be greater than zero",
        ));
    }

    let worker = &config.jobs.worker;
    if worker.poll_interval_ms == 0 {
        return Err(GraftoError::configuration("jobs.worker.poll_interval_ms must be greater than zero"));
    }
    if worker.concurrency == 0 {
        return Err(GraftoError::configuration("jobs.worker.concurrency must be greater than zero"));
    }

    let report = &config.jobs.scheduler.weekly_report;
    if report.enabled && report.recipient.is_empty() {
        return Err(GraftoError::configuration(
            "jobs.scheduler.weekly_report.recipient is required when the report is enabled",
        ));
    }

    if config.mail.provider == crate::MailProvider::Postmark && config.mail.postmark_api_token.is_none() {
        return Err(GraftoError::configuration("mail.postmark_api_token is required for the postmark provider"));
    }

    if config.app.environment == "production" && config.mail.provider == crate::MailProvider::Log {
        warn!("Mail provider is 'log' in production; emails will not be delivered");
    }

    Ok(())
}

fn config_error_to_grafto_error(err: ConfigError) -> GraftoError {
    GraftoError::Configuration(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BackoffStrategy, MailProvider};
    use std::fs;

    #[test]
    fn test_default_config_is_valid() {
        let config = AppConfig::default();
        assert!(validate_config(&config).is_ok());
        assert_eq!(config.jobs.queue.batch_size, 50);
        assert_eq!(config.mail.provider, MailProvider::Log);
    }

    #[test]
    fn test_load_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("default.toml"),
            r#"
[database]
url = "postgres://test:test@db:5432/test"

[jobs.queue]
max_retries = 3

[jobs.queue.backoff]
strategy = "linear"
initial_delay_ms = 250
"#,
        )
        .unwrap();

        let loader = ConfigLoader::new(dir.path().to_string_lossy().to_string()).unwrap();
        let config = loader.get();

        assert_eq!(config.database.url, "postgres://test:test@db:5432/test");
        assert_eq!(config.database.max_connections, 10);
        assert_eq!(config.jobs.queue.max_retries, 3);
        assert_eq!(config.jobs.queue.batch_size, 50);
        assert_eq!(config.jobs.queue.backoff.strategy, BackoffStrategy::Linear);
        assert_eq!(config.jobs.queue.backoff.initial_delay_ms, 250);
    }

    #[test]
    fn test_rejects_zero_retries() {
        let mut config = AppConfig::default();
        config.jobs.queue.max_retries = 0;
        assert!(matches!(validate_config(&config), Err(GraftoError::Configuration(_))));
    }

    #[test]
    fn test_rejects_zero_backoff() {
        let mut config = AppConfig::default();
        config.jobs.queue.backoff.initial_delay_ms = 0;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_rejects_postmark_without_token() {
        let mut config = AppConfig::default();
        config.mail.provider = MailProvider::Postmark;
        assert!(validate_config(&config).is_err());

        config.mail.postmark_api_token = Some("server-token".to_string());
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_rejects_report_without_recipient() {
        let mut config = AppConfig::default();
        config.jobs.scheduler.weekly_report.enabled = true;
        assert!(validate_config(&config).is_err());
    }
}
