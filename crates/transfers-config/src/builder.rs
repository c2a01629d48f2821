//! Configuration builder for layered configuration loading

use crate::{Config, ConfigError, ConfigResult};
use config::{ConfigBuilder as ConfigBuilderInner, Environment, File, FileFormat};
use std::path::{Path, PathBuf};

/// Configuration builder for loading configuration from multiple sources
///
/// Sources are layered in the order they were added, on top of [`Config::default`].
#[derive(Debug)]
pub struct ConfigBuilder {
    inner: ConfigBuilderInner<config::builder::DefaultState>,
    sources: Vec<ConfigSource>,
    env_separator: String,
}

#[derive(Debug, Clone)]
enum ConfigSource {
    File { path: PathBuf, format: FileFormat },
    Defaults,
    Environment { prefix: String },
}

impl ConfigBuilder {
    /// Create a new configuration builder
    pub fn new() -> Self {
        Self {
            inner: config::Config::builder(),
            sources: Vec::new(),
            env_separator: "__".to_string(),
        }
    }

    /// Add default configuration values
    pub fn add_defaults(mut self) -> Self {
        self.sources.push(ConfigSource::Defaults);
        self
    }

    /// Add a configuration file source, skipped if the file does not exist
    pub fn add_source_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        let path = path.as_ref().to_path_buf();
        let format = Self::detect_format(&path);
        self.sources.push(ConfigSource::File { path, format });
        self
    }

    /// Add environment variable source with prefix
    pub fn add_env_prefix<S: Into<String>>(mut self, prefix: S) -> Self {
        self.sources.push(ConfigSource::Environment {
            prefix: prefix.into(),
        });
        self
    }

    /// Set environment variable separator (default: "__")
    pub fn env_separator<S: Into<String>>(mut self, separator: S) -> Self {
        self.env_separator = separator.into();
        self
    }

    /// Build and validate the configuration
    pub fn build(mut self) -> ConfigResult<Config> {
        let defaults = Config::default();
        let defaults_value = serde_json::to_value(&defaults)
            .map_err(|e| ConfigError::other(format!("Failed to serialize defaults: {}", e)))?;
        self.inner = self
            .inner
            .add_source(config::Config::try_from(&defaults_value)?);

        for source in &self.sources {
            match source {
                ConfigSource::File { path, format } => {
                    if path.exists() {
                        self.inner = self
                            .inner
                            .add_source(File::from(path.clone()).format(*format));
                    }
                }
                ConfigSource::Environment { prefix } => {
                    self.inner = self.inner.add_source(
                        Environment::with_prefix(prefix)
                            .separator(&self.env_separator)
                            .try_parsing(true)
                            .list_separator(",")
                            .with_list_parse_key("security.trusted_services"),
                    );
                }
                ConfigSource::Defaults => {
                    // Always applied first
                }
            }
        }

        let config = self.inner.build()?;
        let result: Config = config.try_deserialize()?;

        Self::validate(&result)?;

        Ok(result)
    }

    /// Try to build the configuration, returning defaults on error
    pub fn build_or_default(self) -> Config {
        self.build().unwrap_or_default()
    }

    fn detect_format(path: &Path) -> FileFormat {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => FileFormat::Toml,
            Some("json") => FileFormat::Json,
            _ => FileFormat::Yaml,
        }
    }

    /// Validate the configuration
    pub fn validate(config: &Config) -> ConfigResult<()> {
        if config.workers.worker_id.trim().is_empty() {
            return Err(ConfigError::validation("Worker id must not be empty"));
        }

        if config.workers.parent_pool_size == 0 {
            return Err(ConfigError::validation(
                "Parent pool size must be greater than 0",
            ));
        }

        if config.workers.child_group_count == 0 || config.workers.child_group_size == 0 {
            return Err(ConfigError::validation(
                "Child group count and size must be greater than 0",
            ));
        }

        if config.workers.capacity_multiplier == 0 {
            return Err(ConfigError::validation(
                "Capacity multiplier must be greater than 0",
            ));
        }

        if config.scheduler.max_tasks_per_poll == 0 || config.scheduler.per_user_depth == 0 {
            return Err(ConfigError::validation(
                "Scheduler limits must be greater than 0",
            ));
        }

        for (name, retry) in [
            ("transfer", &config.retry.transfer),
            ("service", &config.retry.service),
        ] {
            retry
                .validate()
                .map_err(|e| ConfigError::invalid_value(format!("retry.{name}"), e))?;
        }

        if config.retry.parent_attempts == 0 {
            return Err(ConfigError::validation(
                "Parent attempts must be at least 1",
            ));
        }

        if config.limits.max_listing_items == 0 {
            return Err(ConfigError::validation(
                "Maximum listing items must be greater than 0",
            ));
        }

        if config.client.stream_chunk_size < 1024 {
            return Err(ConfigError::validation(
                "Stream chunk size must be at least 1024 bytes",
            ));
        }

        if config.queue.parent_prefetch == 0 || config.queue.child_prefetch == 0 {
            return Err(ConfigError::validation(
                "Queue prefetch must be greater than 0",
            ));
        }

        if !["trace", "debug", "info", "warn", "error"].contains(&config.logging.level.as_str()) {
            return Err(ConfigError::validation(
                "Log level must be one of: trace, debug, info, warn, error",
            ));
        }

        Ok(())
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_builder_defaults() {
        let config = ConfigBuilder::new().add_defaults().build().unwrap();
        assert_eq!(config.workers.child_group_count, 8);
        assert_eq!(config.limits.max_listing_items, 20_000);
    }

    #[test]
    fn test_builder_yaml_file() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(
            temp_file,
            r#"
workers:
  worker_id: worker-a
  parent_pool_size: 2
scheduler:
  per_user_depth: 3
security:
  trusted_services: [jobs]
"#
        )
        .unwrap();

        let config = ConfigBuilder::new()
            .add_defaults()
            .add_source_file(temp_file.path())
            .build()
            .unwrap();

        assert_eq!(config.workers.worker_id, "worker-a");
        assert_eq!(config.workers.parent_pool_size, 2);
        assert_eq!(config.scheduler.per_user_depth, 3);
        assert_eq!(config.scheduler.max_tasks_per_poll, 50);
        assert!(config.security.is_trusted("jobs"));
    }

    #[test]
    fn test_builder_validation() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(
            temp_file,
            r#"
workers:
  parent_pool_size: 0
"#
        )
        .unwrap();

        let result = ConfigBuilder::new()
            .add_defaults()
            .add_source_file(temp_file.path())
            .build();

        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Parent pool size must be greater than 0"));
    }

    #[test]
    fn test_missing_file_is_skipped() {
        let config = ConfigBuilder::new()
            .add_defaults()
            .add_source_file("/nonexistent/transfers.yaml")
            .build()
            .unwrap();
        assert_eq!(config.queue.parent_prefetch, 4);
    }
}
