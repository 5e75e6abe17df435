//! Configuration loader with layered sources.

use crate::{AppConfig, ConfigValidator};
use config::{Config, ConfigError, Environment, File};
use imgq_core::ImgqError;
use std::path::Path;
use tracing::{debug, info};

/// Configuration loader.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    config: AppConfig,
    config_dir: String,
}

impl ConfigLoader {
    /// Creates a new configuration loader.
    ///
    /// Configuration is loaded from multiple sources in order:
    /// 1. `{config_dir}/default.toml` - Default values
    /// 2. `{config_dir}/{environment}.toml` - Environment-specific overrides
    /// 3. `{config_dir}/local.toml` - Local overrides
    /// 4. Environment variables with `IMGQ_` prefix (`IMGQ_QUEUE__MAX_ATTEMPTS=5`)
    /// 5. `REDIS_URL`, `REDIS_HOST`, `REDIS_PORT`, `REDIS_PASSWORD`, `REDIS_DB`
    pub fn new(config_dir: impl Into<String>) -> Result<Self, ImgqError> {
        let config_dir = config_dir.into();
        let config = Self::load_config(&config_dir)?;

        Ok(Self { config, config_dir })
    }

    /// Loads configuration from the default location (`./config`).
    pub fn from_default_location() -> Result<Self, ImgqError> {
        Self::new("./config")
    }

    /// Returns the loaded configuration.
    #[must_use]
    pub fn get(&self) -> &AppConfig {
        &self.config
    }

    /// Consumes the loader and returns the configuration.
    #[must_use]
    pub fn into_config(self) -> AppConfig {
        self.config
    }

    /// Reloads the configuration from disk and environment.
    pub fn reload(&mut self) -> Result<(), ImgqError> {
        self.config = Self::load_config(&self.config_dir)?;
        info!("Configuration reloaded successfully");
        Ok(())
    }

    fn load_config(config_dir: &str) -> Result<AppConfig, ImgqError> {
        if let Err(e) = dotenvy::dotenv() {
            debug!("No .env file found or error loading it: {}", e);
        }

        let environment =
            std::env::var("IMGQ_ENVIRONMENT").unwrap_or_else(|_| "development".to_string());

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
            Environment::with_prefix("IMGQ")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build().map_err(config_error_to_imgq_error)?;

        let mut app_config: AppConfig = config
            .try_deserialize()
            .map_err(config_error_to_imgq_error)?;

        app_config.broker.apply_env_overrides();

        ConfigValidator::validate(&app_config).map_err(|errors| {
            let joined = errors
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ");
            ImgqError::Configuration(joined)
        })?;

        Ok(app_config)
    }
}

fn config_error_to_imgq_error(err: ConfigError) -> ImgqError {
    ImgqError::Configuration(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_loads_default_toml() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("default.toml"),
            r#"
[monitor]
interval_secs = 5
stability_threshold = 4

[dead_letter]
directory = "/var/lib/imgq/failed"
retention_count = 50
"#,
        )
        .unwrap();

        let loader = ConfigLoader::new(dir.path().to_string_lossy().to_string()).unwrap();
        let config = loader.get();

        assert_eq!(config.monitor.interval_secs, 5);
        assert_eq!(config.monitor.stability_threshold, 4);
        assert_eq!(config.dead_letter.retention_count, 50);
        assert_eq!(config.queue.max_attempts, 3);
    }

    #[test]
    fn test_invalid_file_values_fail_validation() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("default.toml"),
            "[monitor]\nstability_threshold = 0\n",
        )
        .unwrap();

        let result = ConfigLoader::new(dir.path().to_string_lossy().to_string());
        assert!(matches!(result, Err(ImgqError::Configuration(_))));
    }

    #[test]
    fn test_missing_directory_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");

        let loader = ConfigLoader::new(missing.to_string_lossy().to_string()).unwrap();
        assert_eq!(loader.get().queue.job_timeout_secs, 300);
    }
}
